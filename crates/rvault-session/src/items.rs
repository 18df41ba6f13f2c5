//! The item list of one recording session.
//!
//! Items are the units a tape breaks into: real catalogue items plus junk
//! spans (bars, blank tape) that get captured but never kept. During
//! review the operator carves the single captured clip into per-item
//! clips; the chunker then turns each enabled, non-junk clip into its own
//! output file.

use rvault_types::SourceItem;

use crate::{Result, SessionError};

/// A span of one captured file: `[start_position, start_position + duration)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Clip {
    pub filename: String,
    pub start_position: i64,
    pub duration: i64,
}

impl Clip {
    pub fn end(&self) -> i64 {
        self.start_position + self.duration
    }
}

/// One unit within a recording session.
#[derive(Debug, Clone)]
pub struct RecordingItem {
    /// Stable identifier, unaffected by reordering.
    pub id: u32,
    /// Display position; items are totally ordered by index.
    pub index: u32,
    pub is_disabled: bool,
    pub is_junk: bool,
    pub source: SourceItem,
    /// Unset until this item's content has been captured and assigned.
    pub clip: Option<Clip>,
    /// Final filename, assigned once the item has been chunked.
    pub chunked_filename: Option<String>,
    /// Created by a split; removed again when its clip is cleared.
    inserted: bool,
}

impl RecordingItem {
    fn new(id: u32, index: u32, source: SourceItem) -> Self {
        RecordingItem {
            id,
            index,
            is_disabled: false,
            is_junk: false,
            source,
            clip: None,
            chunked_filename: None,
            inserted: false,
        }
    }
}

/// Ordered item list plus the two change counters pollers diff against.
#[derive(Debug)]
pub struct RecordingItems {
    items: Vec<RecordingItem>,
    next_id: u32,
    locked: bool,
    clip_change_count: u64,
    source_change_count: u64,
}

impl RecordingItems {
    /// Seed one item per catalogued source item, in tape order.
    pub fn new(sources: Vec<SourceItem>) -> Self {
        let items = sources
            .into_iter()
            .enumerate()
            .map(|(i, source)| RecordingItem::new(i as u32 + 1, i as u32, source))
            .collect::<Vec<_>>();
        let next_id = items.len() as u32 + 1;
        RecordingItems {
            items,
            next_id,
            locked: false,
            clip_change_count: 0,
            source_change_count: 0,
        }
    }

    pub fn items(&self) -> &[RecordingItem] {
        &self.items
    }

    pub fn get(&self, id: u32) -> Option<&RecordingItem> {
        self.items.iter().find(|i| i.id == id)
    }

    /// Bumped whenever a clip boundary changes.
    pub fn clip_change_count(&self) -> u64 {
        self.clip_change_count
    }

    /// Bumped whenever ordering or enablement changes.
    pub fn source_change_count(&self) -> u64 {
        self.source_change_count
    }

    /// Freeze ordering once chunking starts.
    pub fn lock(&mut self) {
        self.locked = true;
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Hand the whole captured recording to the first enabled item.
    pub fn set_combined_clip(&mut self, filename: &str, total_duration: i64) -> Result<()> {
        let item = self
            .items
            .iter_mut()
            .find(|i| !i.is_disabled)
            .ok_or_else(|| SessionError::Invalid("no enabled items".into()))?;
        item.clip = Some(Clip {
            filename: filename.to_string(),
            start_position: 0,
            duration: total_duration,
        });
        self.clip_change_count += 1;
        Ok(())
    }

    /// Split the clip containing `position` in two. The tail span goes to
    /// the next clip-less enabled item, or to a freshly inserted item when
    /// none exists (always inserted for junk spans).
    ///
    /// Returns the id of the item now holding the tail.
    pub fn mark_item_start(
        &mut self,
        position: i64,
        source: Option<SourceItem>,
        junk: bool,
    ) -> Result<u32> {
        if self.locked {
            return Err(SessionError::Invalid("item list is locked".into()));
        }
        let holder_pos = self
            .items
            .iter()
            .position(|i| {
                i.clip
                    .as_ref()
                    .is_some_and(|c| c.start_position < position && position < c.end())
            })
            .ok_or_else(|| {
                SessionError::Invalid(format!("no clip spans position {}", position))
            })?;

        let (filename, tail_duration) = {
            let clip = self.items[holder_pos].clip.as_mut().expect("holder has a clip");
            let tail = clip.end() - position;
            clip.duration = position - clip.start_position;
            (clip.filename.clone(), tail)
        };
        let tail = Clip { filename, start_position: position, duration: tail_duration };

        // An already-seeded, still-unassigned enabled item takes the tail
        // in preference to inserting a new one.
        let successor = self.items[holder_pos + 1..]
            .iter()
            .position(|i| i.clip.is_none() && !i.is_disabled && !junk)
            .map(|off| holder_pos + 1 + off);

        let id = match successor {
            Some(pos) => {
                self.items[pos].clip = Some(tail);
                self.items[pos].id
            }
            None => {
                let id = self.next_id;
                self.next_id += 1;
                let holder = &self.items[holder_pos];
                let mut item = RecordingItem::new(
                    id,
                    holder.index + 1,
                    source.unwrap_or_else(|| holder.source.clone()),
                );
                item.is_junk = junk;
                item.clip = Some(tail);
                item.inserted = true;
                self.items.insert(holder_pos + 1, item);
                self.reindex();
                self.source_change_count += 1;
                id
            }
        };
        self.clip_change_count += 1;
        Ok(id)
    }

    /// Merge an item's clip back into its predecessor. Split-inserted
    /// items disappear; seeded items stay but lose their clip.
    pub fn clear_item(&mut self, id: u32) -> Result<()> {
        if self.locked {
            return Err(SessionError::Invalid("item list is locked".into()));
        }
        let pos = self
            .items
            .iter()
            .position(|i| i.id == id)
            .ok_or_else(|| SessionError::Invalid(format!("no item {}", id)))?;
        if pos == 0 {
            return Err(SessionError::Invalid("first item has no predecessor".into()));
        }
        let clip = self.items[pos]
            .clip
            .clone()
            .ok_or_else(|| SessionError::Invalid("item has no clip to clear".into()))?;

        let predecessor = self.items[..pos]
            .iter_mut()
            .rev()
            .find(|i| i.clip.is_some())
            .ok_or_else(|| SessionError::Invalid("no predecessor clip to merge into".into()))?;
        let pred_clip = predecessor.clip.as_mut().expect("found above");
        if pred_clip.end() != clip.start_position {
            return Err(SessionError::Invalid("clips are not adjacent".into()));
        }
        pred_clip.duration += clip.duration;

        if self.items[pos].inserted {
            self.items.remove(pos);
            self.reindex();
            self.source_change_count += 1;
        } else {
            self.items[pos].clip = None;
        }
        self.clip_change_count += 1;
        Ok(())
    }

    pub fn move_item_up(&mut self, id: u32) -> Result<()> {
        let pos = self.reorder_precondition(id)?;
        if pos == 0 {
            return Ok(());
        }
        self.items.swap(pos - 1, pos);
        self.reindex();
        self.source_change_count += 1;
        Ok(())
    }

    pub fn move_item_down(&mut self, id: u32) -> Result<()> {
        let pos = self.reorder_precondition(id)?;
        if pos + 1 >= self.items.len() {
            return Ok(());
        }
        self.items.swap(pos, pos + 1);
        self.reindex();
        self.source_change_count += 1;
        Ok(())
    }

    pub fn disable_item(&mut self, id: u32) -> Result<()> {
        let pos = self.reorder_precondition(id)?;
        self.items[pos].is_disabled = true;
        self.source_change_count += 1;
        Ok(())
    }

    pub fn enable_item(&mut self, id: u32) -> Result<()> {
        if self.locked {
            return Err(SessionError::Invalid("item list is locked".into()));
        }
        let item = self
            .items
            .iter_mut()
            .find(|i| i.id == id)
            .ok_or_else(|| SessionError::Invalid(format!("no item {}", id)))?;
        item.is_disabled = false;
        self.source_change_count += 1;
        Ok(())
    }

    /// Chunking may start once every enabled item has an assigned clip;
    /// whatever was never assigned must have been explicitly disabled.
    pub fn ready_for_chunking(&self) -> bool {
        !self.items.is_empty()
            && self.items.iter().all(|i| {
                i.is_disabled || i.clip.as_ref().is_some_and(|c| c.duration >= 0)
            })
    }

    /// Record the output filename once an item has been chunked.
    pub fn set_chunked(&mut self, id: u32, filename: &str) {
        if let Some(item) = self.items.iter_mut().find(|i| i.id == id) {
            item.chunked_filename = Some(filename.to_string());
            self.clip_change_count += 1;
        }
    }

    /// Sum of all non-junk assigned clip durations.
    pub fn assigned_duration(&self) -> i64 {
        self.items
            .iter()
            .filter(|i| !i.is_junk)
            .filter_map(|i| i.clip.as_ref())
            .map(|c| c.duration)
            .sum()
    }

    fn reorder_precondition(&mut self, id: u32) -> Result<usize> {
        if self.locked {
            return Err(SessionError::Invalid("item list is locked".into()));
        }
        let pos = self
            .items
            .iter()
            .position(|i| i.id == id)
            .ok_or_else(|| SessionError::Invalid(format!("no item {}", id)))?;
        if self.items[pos].clip.is_some() {
            return Err(SessionError::Invalid(
                "item already has captured content assigned".into(),
            ));
        }
        Ok(pos)
    }

    fn reindex(&mut self) {
        for (i, item) in self.items.iter_mut().enumerate() {
            item.index = i as u32;
        }
    }
}
