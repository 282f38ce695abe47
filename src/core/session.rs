//! Sessions: the unit of isolation whose state model jobs serialize on.

use std::sync::Arc;

use uuid::Uuid;

use crate::core::semaphore::MutexKey;

/// An opaque client session.
///
/// The scheduler never inspects session state; a session matters to it only
/// as the owner of the model mutex that serializes all model jobs of that
/// session. Two sessions never share a mutex, so their model jobs run
/// concurrently with each other.
#[derive(Debug)]
pub struct Session {
    id: Uuid,
    name: String,
    model_mutex: MutexKey,
}

impl Session {
    /// Create a session with a fresh identity and a dedicated model mutex
    /// of capacity 1.
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        let name = name.into();
        let model_mutex = MutexKey::new(format!("model-mutex[{name}]"));
        Arc::new(Self {
            id: Uuid::new_v4(),
            name,
            model_mutex,
        })
    }

    /// Unique session identity.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Diagnostic session name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The mutex all model jobs of this session compete on.
    #[must_use]
    pub fn model_job_mutex(&self) -> MutexKey {
        self.model_mutex.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sessions_have_distinct_mutexes() {
        let a = Session::new("a");
        let b = Session::new("b");
        assert_ne!(a.id(), b.id());
        assert_ne!(a.model_job_mutex(), b.model_job_mutex());
        assert_eq!(a.model_job_mutex(), a.model_job_mutex());
    }
}
