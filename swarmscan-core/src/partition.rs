//! Splitting queued pages into per-participant chunks.

use crate::context::{ElementRef, ScanContext};
use crate::model::{Fingerprint, PageArena, PageData, PageId};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Pages assigned to one participant for one distribution round. Every page
/// carries a whitelist naming the elements that participant audits.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub pages: Vec<PageData>,
}

impl Chunk {
    pub fn element_count(&self) -> usize {
        self.pages.iter().map(PageData::audit_element_count).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }
}

/// Partition `unseen` into `slots` contiguous groups whose element counts
/// differ by at most one.
///
/// Each group becomes a chunk holding one page per owning page, whitelisted
/// to that group's fingerprints. Pages of `pages` that own none of the unseen
/// elements are dealt round-robin with an empty whitelist so they still get
/// inspected.
pub fn partition(
    arena: &PageArena,
    pages: &[PageId],
    unseen: &[ElementRef],
    slots: usize,
) -> Vec<Chunk> {
    let slots = slots.max(1);
    let base = unseen.len() / slots;
    let extra = unseen.len() % slots;

    let mut chunks = Vec::with_capacity(slots);
    let mut offset = 0;
    for slot in 0..slots {
        let size = base + usize::from(slot < extra);
        let group = &unseen[offset..offset + size];
        offset += size;

        // Owning pages in first-seen order, indexed by page.
        let mut owners: Vec<(PageId, Vec<Fingerprint>)> = Vec::new();
        let mut owner_index: HashMap<PageId, usize> = HashMap::new();
        for element in group {
            match owner_index.get(&element.page) {
                Some(&index) => owners[index].1.push(element.fingerprint),
                None => {
                    owner_index.insert(element.page, owners.len());
                    owners.push((element.page, vec![element.fingerprint]));
                }
            }
        }

        let pages = owners
            .into_iter()
            .filter_map(|(page, whitelist)| {
                let mut data = arena.to_data(page)?;
                data.whitelist = Some(whitelist);
                Some(data)
            })
            .collect();
        chunks.push(Chunk { pages });
    }

    let contributing: HashSet<PageId> = unseen.iter().map(|e| e.page).collect();
    let idle_pages = pages.iter().filter(|page| !contributing.contains(page));
    for (index, &page) in idle_pages.enumerate() {
        if let Some(mut data) = arena.to_data(page) {
            data.whitelist = Some(Vec::new());
            chunks[index % slots].pages.push(data);
        }
    }

    chunks
}

/// Claim the unseen elements of `pages` and split them over the local
/// instance plus `idle_count` participants.
pub async fn split(ctx: &ScanContext, pages: &[PageId], idle_count: usize) -> Vec<Chunk> {
    ctx.with(|s| {
        let unseen = s.filter_elements(pages);
        partition(&s.arena, pages, &unseen, idle_count + 1)
    })
    .await
}
