//! # Playlist
//!
//! The ordered content schedule the device renders.
//!
//! ## Mutation Model
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Playlist                                        │
//! │                                                                         │
//! │   refresh ──► replace()      whole item set swapped                    │
//! │   add     ──► upsert()       insert, or update if id already present   │
//! │   remove  ──► remove()       by id; cache entry left for LRU           │
//! │   update  ──► apply_patch()  overlay fields by id                      │
//! │                                                                         │
//! │   After every mutation: stable sort by `order`                         │
//! │   Always: ids unique, every item validated                             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::{BTreeSet, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CoreError, CoreResult, ValidationError};
use crate::types::{lenient, MediaItem, RawMediaItem};

// =============================================================================
// Wire Document
// =============================================================================

/// Playlist document as returned by `GET {base}/api/playlist`.
///
/// Items stay as raw JSON values so one badly-typed item cannot fail the
/// whole document.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistDocument {
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub playlist_id: Option<String>,

    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub version: Option<String>,

    #[serde(default)]
    pub last_updated: Option<String>,

    #[serde(default)]
    pub items: Vec<Value>,
}

/// An item dropped at the parse boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedItem {
    pub id: Option<String>,
    pub reason: String,
}

/// Result of parsing a playlist document.
#[derive(Debug, Clone)]
pub struct ParsedPlaylist {
    pub playlist: Playlist,
    pub rejected: Vec<RejectedItem>,
}

/// What an upsert did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Added,
    Updated { source_changed: bool },
}

// =============================================================================
// Playlist
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Playlist {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub playlist_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,

    items: Vec<MediaItem>,
}

impl Playlist {
    /// An empty playlist (nothing fetched yet).
    pub fn empty() -> Self {
        Self::default()
    }

    /// Parses a playlist JSON document.
    ///
    /// Fails only if the document itself is not a JSON object of the right
    /// shape; individual bad items are reported in `rejected`.
    pub fn parse(json: &str) -> Result<ParsedPlaylist, serde_json::Error> {
        let doc: PlaylistDocument = serde_json::from_str(json)?;
        Ok(Self::from_document(doc))
    }

    /// Validates every item of a document.
    pub fn from_document(doc: PlaylistDocument) -> ParsedPlaylist {
        let mut items = Vec::with_capacity(doc.items.len());
        let mut rejected = Vec::new();
        let mut seen = HashSet::new();

        for value in doc.items {
            let hint = value
                .get("id")
                .and_then(|v| match v {
                    Value::String(s) => Some(s.clone()),
                    Value::Number(n) => Some(n.to_string()),
                    _ => None,
                });

            let parsed = serde_json::from_value::<RawMediaItem>(value)
                .map_err(|e| ValidationError::InvalidFormat {
                    field: "item".to_string(),
                    reason: e.to_string(),
                })
                .and_then(MediaItem::try_from)
                .and_then(|item| {
                    if seen.insert(item.id.clone()) {
                        Ok(item)
                    } else {
                        Err(ValidationError::Duplicate {
                            field: "id".to_string(),
                            value: item.id,
                        })
                    }
                });

            match parsed {
                Ok(item) => items.push(item),
                Err(e) => rejected.push(RejectedItem {
                    id: hint,
                    reason: e.to_string(),
                }),
            }
        }

        let last_updated = doc
            .last_updated
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc));

        let mut playlist = Playlist {
            playlist_id: doc.playlist_id,
            version: doc.version,
            last_updated,
            items,
        };
        playlist.sort();

        ParsedPlaylist { playlist, rejected }
    }

    /// Items in playback order.
    pub fn items(&self) -> &[MediaItem] {
        &self.items
    }

    pub fn get(&self, id: &str) -> Option<&MediaItem> {
        self.items.iter().find(|i| i.id == id)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Swaps in a freshly fetched playlist wholesale.
    pub fn replace(&mut self, fresh: Playlist) {
        *self = fresh;
        self.sort();
    }

    /// Inserts an item, or updates it in place if the id already exists.
    pub fn upsert(&mut self, item: MediaItem) -> UpsertOutcome {
        let outcome = match self.items.iter_mut().find(|i| i.id == item.id) {
            Some(existing) => {
                let source_changed = existing.source_url != item.source_url;
                *existing = item;
                UpsertOutcome::Updated { source_changed }
            }
            None => {
                self.items.push(item);
                UpsertOutcome::Added
            }
        };
        self.sort();
        outcome
    }

    /// Removes an item by id.
    pub fn remove(&mut self, id: &str) -> Option<MediaItem> {
        let idx = self.items.iter().position(|i| i.id == id)?;
        Some(self.items.remove(idx))
    }

    /// Overlays a partial item onto the existing item with the same id.
    ///
    /// Returns the updated item and whether its source URL changed.
    pub fn apply_patch(&mut self, patch: &RawMediaItem) -> CoreResult<(MediaItem, bool)> {
        let id = patch
            .id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| ValidationError::Required {
                field: "id".to_string(),
            })?;

        let current = self
            .get(id)
            .ok_or_else(|| CoreError::ItemNotFound(id.to_string()))?;
        let updated = current.patched(patch)?;

        match self.upsert(updated.clone()) {
            UpsertOutcome::Updated { source_changed } => Ok((updated, source_changed)),
            UpsertOutcome::Added => Ok((updated, true)),
        }
    }

    /// Source URLs the cache must not evict.
    pub fn referenced_urls(&self) -> BTreeSet<String> {
        self.items.iter().map(|i| i.source_url.clone()).collect()
    }

    fn sort(&mut self) {
        // Vec::sort_by_key is stable: equal orders keep arrival order
        self.items.sort_by_key(|i| i.order);
    }
}
