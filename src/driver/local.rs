//! In-memory room listing store

use super::{sort_listings, MatchmakerDriver, RoomListing, RoomQuery};
use crate::error::Result;
use anyhow::bail;
use async_trait::async_trait;
use std::sync::Mutex;

/// In-memory driver backing single-node mode. Linearizable within the
/// process; a single instance can be shared by several matchmakers to model
/// a cluster without an external store.
#[derive(Default)]
pub struct LocalDriver {
    listings: Mutex<Vec<RoomListing>>,
}

impl LocalDriver {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_listings<T>(&self, apply: impl FnOnce(&mut Vec<RoomListing>) -> T) -> Result<T> {
        let mut listings = match self.listings.lock() {
            Ok(listings) => listings,
            Err(_) => bail!("listing store lock poisoned"),
        };
        Ok(apply(&mut listings))
    }
}

#[async_trait]
impl MatchmakerDriver for LocalDriver {
    async fn save(&self, listing: &RoomListing) -> Result<()> {
        self.with_listings(|listings| {
            match listings
                .iter_mut()
                .find(|existing| existing.room_id == listing.room_id)
            {
                Some(existing) => *existing = listing.clone(),
                None => listings.push(listing.clone()),
            }
        })
    }

    async fn remove(&self, room_id: &str) -> Result<()> {
        self.with_listings(|listings| {
            listings.retain(|listing| listing.room_id != room_id);
        })
    }

    async fn find(&self, query: &RoomQuery) -> Result<Vec<RoomListing>> {
        self.with_listings(|listings| {
            let mut matched: Vec<RoomListing> = listings
                .iter()
                .filter(|listing| listing.matches(&query.conditions))
                .cloned()
                .collect();
            sort_listings(&mut matched, &query.sort);
            matched
        })
    }

    async fn find_one(&self, query: &RoomQuery) -> Result<Option<RoomListing>> {
        Ok(self.find(query).await?.into_iter().next())
    }
}
