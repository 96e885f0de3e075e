use crate::media::MediaStream;
use crate::session_store::PersistedParticipant;

#[derive(Debug, Clone)]
pub struct Participant {
    pub id: String,
    /// `None` until the connection delivers tracks.
    pub stream: Option<MediaStream>,
    pub is_local: bool,
}

impl Participant {
    pub fn local(id: impl Into<String>, stream: MediaStream) -> Self {
        Self {
            id: id.into(),
            stream: Some(stream),
            is_local: true,
        }
    }

    pub fn remote(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            stream: None,
            is_local: false,
        }
    }
}

/// Participants of one room, unique by id, with at most one local entry.
#[derive(Debug, Clone, Default)]
pub struct Participants {
    entries: Vec<Participant>,
}

impl Participants {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces by id. A new local entry displaces the old one.
    pub fn upsert(&mut self, participant: Participant) {
        if participant.is_local {
            self.entries.retain(|p| !p.is_local || p.id == participant.id);
        }
        match self.entries.iter_mut().find(|p| p.id == participant.id) {
            Some(existing) => *existing = participant,
            None => self.entries.push(participant),
        }
    }

    /// Adds a remote participant without media. Returns false if known.
    pub fn insert_remote(&mut self, id: &str) -> bool {
        if self.contains(id) {
            return false;
        }
        self.entries.push(Participant::remote(id));
        true
    }

    /// Binds a remote stream to a known participant. Returns false when the
    /// id is unknown or already had this exact stream.
    pub fn set_stream(&mut self, id: &str, stream: MediaStream) -> bool {
        let Some(existing) = self.entries.iter_mut().find(|p| p.id == id) else {
            return false;
        };
        if existing.stream.as_ref().is_some_and(|s| s.same_as(&stream)) {
            return false;
        }
        existing.stream = Some(stream);
        true
    }

    /// Removes a participant and stops its tracks.
    pub fn remove(&mut self, id: &str) -> Option<Participant> {
        let index = self.entries.iter().position(|p| p.id == id)?;
        let participant = self.entries.remove(index);
        if let Some(stream) = &participant.stream {
            stream.stop_all();
        }
        Some(participant)
    }

    pub fn clear(&mut self) {
        for participant in self.entries.drain(..) {
            if let Some(stream) = participant.stream {
                stream.stop_all();
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<&Participant> {
        self.entries.iter().find(|p| p.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    pub fn local(&self) -> Option<&Participant> {
        self.entries.iter().find(|p| p.is_local)
    }

    pub fn remotes(&self) -> impl Iterator<Item = &Participant> {
        self.entries.iter().filter(|p| !p.is_local)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Participant> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_persisted(&self) -> Vec<PersistedParticipant> {
        self.entries
            .iter()
            .map(|p| PersistedParticipant {
                id: p.id.clone(),
                is_local: p.is_local,
            })
            .collect()
    }
}
