//! Durable copies of the session that survive restarts

use std::error;

use async_trait::async_trait;

use crate::Session;

/// An error raised by a persistence layer
pub type PersistError = Box<dyn error::Error + Send + Sync + 'static>;

/// A durable home for the session
///
/// Persistence is best effort. The in-memory credential store remains the
/// source of truth; failures here are logged by the session manager and do
/// not fail the operation that triggered them.
#[async_trait]
pub trait SessionPersistence: Send + Sync + std::fmt::Debug {
    /// Loads a previously persisted session
    async fn load(&self) -> Result<Option<Session>, PersistError>;

    /// Persists the session, replacing anything stored before
    async fn persist(&self, session: &Session) -> Result<(), PersistError>;

    /// Removes any persisted session
    async fn erase(&self) -> Result<(), PersistError>;
}

/// Persistence that remembers nothing
#[derive(Clone, Copy, Debug, Default)]
pub struct NoPersistence;

#[async_trait]
impl SessionPersistence for NoPersistence {
    async fn load(&self) -> Result<Option<Session>, PersistError> {
        Ok(None)
    }

    async fn persist(&self, _: &Session) -> Result<(), PersistError> {
        Ok(())
    }

    async fn erase(&self) -> Result<(), PersistError> {
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use std::sync::{Arc, Mutex};

    use super::*;

    /// Keeps the persisted session in memory
    #[derive(Debug, Default)]
    pub struct MemoryPersistence {
        saved: Mutex<Option<Session>>,
    }

    impl MemoryPersistence {
        pub fn holding(session: Session) -> Arc<Self> {
            Arc::new(Self {
                saved: Mutex::new(Some(session)),
            })
        }

        pub fn saved(&self) -> Option<Session> {
            self.saved.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SessionPersistence for MemoryPersistence {
        async fn load(&self) -> Result<Option<Session>, PersistError> {
            Ok(self.saved())
        }

        async fn persist(&self, session: &Session) -> Result<(), PersistError> {
            *self.saved.lock().unwrap() = Some(session.clone());
            Ok(())
        }

        async fn erase(&self) -> Result<(), PersistError> {
            *self.saved.lock().unwrap() = None;
            Ok(())
        }
    }
}

#[cfg(feature = "file")]
mod file {
    use std::{io, path::PathBuf};

    use async_trait::async_trait;
    use tokio::fs::OpenOptions;

    use super::{PersistError, SessionPersistence};
    use crate::Session;

    /// Persists the session as a JSON document in a local file
    ///
    /// On Unix the file is created readable only by its owner.
    #[derive(Debug)]
    pub struct FilePersistence {
        path: PathBuf,
    }

    impl FilePersistence {
        /// Constructs a new file persistence layer
        pub fn new(path: impl Into<PathBuf>) -> Self {
            Self { path: path.into() }
        }

        async fn read_session(&self) -> Result<Option<Session>, io::Error> {
            use tokio::io::AsyncReadExt;

            let mut file = match OpenOptions::new().read(true).open(&self.path).await {
                Ok(file) => file,
                Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(None),
                Err(error) => return Err(error),
            };
            let mut data = String::new();
            file.read_to_string(&mut data).await?;
            let session = serde_json::from_str(&data)?;
            Ok(Some(session))
        }

        async fn write_session(&self, session: &Session) -> Result<(), io::Error> {
            use tokio::io::AsyncWriteExt;

            let mut file_opts = OpenOptions::new();

            file_opts.create(true).truncate(true).write(true);

            #[cfg(unix)]
            file_opts.mode(0o600);

            let mut file = file_opts.open(&self.path).await?;
            let data = serde_json::to_string_pretty(session)?;
            file.write_all(data.as_bytes()).await?;
            file.flush().await?;
            Ok(())
        }
    }

    #[async_trait]
    impl SessionPersistence for FilePersistence {
        async fn load(&self) -> Result<Option<Session>, PersistError> {
            Ok(self.read_session().await?)
        }

        async fn persist(&self, session: &Session) -> Result<(), PersistError> {
            Ok(self.write_session(session).await?)
        }

        async fn erase(&self) -> Result<(), PersistError> {
            match tokio::fs::remove_file(&self.path).await {
                Ok(()) => Ok(()),
                Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
                Err(error) => Err(error.into()),
            }
        }
    }

}

#[cfg(feature = "file")]
pub use file::FilePersistence;
