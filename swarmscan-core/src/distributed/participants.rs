use super::channel::Channel;
use super::messages::ParticipantInfo;
use crate::model::PageData;
use std::collections::HashSet;
use std::sync::Arc;

pub struct Participant {
    pub info: ParticipantInfo,
    pub channel: Arc<dyn Channel>,
    /// Holds a chunk it has not reported done for.
    pub busy: bool,
    /// Its chunk was delivered; status polls may now mark it done.
    pub dispatched: bool,
    /// Consecutive failed calls.
    pub failures: u32,
    /// Pages delivered since it last reported done.
    pub held: Vec<PageData>,
}

/// Remote participants known to a master, plus the termination bookkeeping.
#[derive(Default)]
pub struct ParticipantSet {
    participants: Vec<Participant>,
    done: HashSet<String>,
    local_finished: bool,
    terminated: bool,
}

impl ParticipantSet {
    /// Record a freshly enslaved participant as idle and done.
    pub fn add(&mut self, info: ParticipantInfo, channel: Arc<dyn Channel>) {
        self.participants.retain(|p| p.info.url != info.url);
        self.done.insert(info.url.clone());
        self.participants.push(Participant {
            info,
            channel,
            busy: false,
            dispatched: false,
            failures: 0,
            held: Vec::new(),
        });
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    pub fn idle_count(&self) -> usize {
        self.participants.iter().filter(|p| !p.busy).count()
    }

    /// Mark every idle participant busy and hand them out. Participants stay
    /// reserved until they report done or their dispatch fails.
    pub fn reserve_idle(&mut self) -> Vec<(ParticipantInfo, Arc<dyn Channel>)> {
        let mut reserved = Vec::new();
        for participant in self.participants.iter_mut().filter(|p| !p.busy) {
            participant.busy = true;
            participant.dispatched = false;
            self.done.remove(&participant.info.url);
            reserved.push((participant.info.clone(), participant.channel.clone()));
        }
        reserved
    }

    /// A chunk was accepted. A participant that already reported done
    /// before the dispatch returned holds nothing more.
    pub fn mark_dispatched(&mut self, url: &str, pages: Vec<PageData>) {
        if let Some(participant) = self.participants.iter_mut().find(|p| p.info.url == url) {
            participant.dispatched = true;
            participant.failures = 0;
            if participant.busy {
                participant.held.extend(pages);
            }
        }
    }

    /// Give back a reservation that was not used.
    pub fn release(&mut self, url: &str) {
        if let Some(participant) = self.participants.iter_mut().find(|p| p.info.url == url) {
            participant.busy = false;
            self.done.insert(url.to_string());
        }
    }

    /// Returns false for unknown participants.
    pub fn mark_done(&mut self, url: &str) -> bool {
        match self.participants.iter_mut().find(|p| p.info.url == url) {
            Some(participant) => {
                participant.busy = false;
                participant.failures = 0;
                participant.held.clear();
                self.done.insert(url.to_string());
                true
            }
            None => false,
        }
    }

    pub fn mark_reachable(&mut self, url: &str) {
        if let Some(participant) = self.participants.iter_mut().find(|p| p.info.url == url) {
            participant.failures = 0;
        }
    }

    /// Count a failed call. The participant leaves the done-set and is no
    /// longer reserved. Once it reaches `max_failures` it is evicted and the
    /// pages it still held are handed back.
    pub fn mark_failed(&mut self, url: &str, max_failures: u32) -> Option<Vec<PageData>> {
        let index = self.participants.iter().position(|p| p.info.url == url)?;

        let participant = &mut self.participants[index];
        participant.busy = false;
        participant.failures += 1;
        self.done.remove(url);

        if participant.failures >= max_failures {
            return Some(self.participants.remove(index).held);
        }
        None
    }

    /// Participants that failed a call and have not recovered since.
    pub fn stalled(&self) -> Vec<String> {
        self.participants
            .iter()
            .filter(|p| p.failures > 0 && !self.done.contains(&p.info.url))
            .map(|p| p.info.url.clone())
            .collect()
    }

    /// Participants outside the done-set whose state a status poll can
    /// settle: those holding a delivered chunk and those that failed a call.
    /// A reservation still being dispatched is left alone.
    pub fn pollable(&self) -> Vec<(ParticipantInfo, Arc<dyn Channel>)> {
        self.participants
            .iter()
            .filter(|p| !self.done.contains(&p.info.url) && (p.dispatched || !p.busy))
            .map(|p| (p.info.clone(), p.channel.clone()))
            .collect()
    }

    pub fn all(&self) -> Vec<(ParticipantInfo, Arc<dyn Channel>)> {
        self.participants
            .iter()
            .map(|p| (p.info.clone(), p.channel.clone()))
            .collect()
    }

    pub fn all_done(&self) -> bool {
        self.participants
            .iter()
            .all(|p| self.done.contains(&p.info.url))
    }

    pub fn set_local_finished(&mut self, finished: bool) {
        self.local_finished = finished;
    }

    /// True exactly once: when the local loop and every participant are done.
    pub fn try_terminate(&mut self) -> bool {
        if self.terminated || !self.local_finished || !self.all_done() {
            return false;
        }
        self.terminated = true;
        true
    }
}
