//! Save-state handler registration: the boundary the rest of the
//! emulator uses to hook into the migration stream. Each migratable
//! subsystem registers `{setup, iterate, complete, load, cancel}` callbacks
//! and an opaque context; the migration driver is itself registered as the
//! "ram" handler, and runs first on both send and load.

use std::io::{Read, Write};

use crate::error::MigrationError;
use crate::stream::MigrationStream;

/// Concrete stream type used on the sending side of a handler.
pub type SendStream = MigrationStream<Box<dyn Write + Send>>;
/// Concrete stream type used on the loading side of a handler.
pub type RecvStream = MigrationStream<Box<dyn Read + Send>>;

/// A migratable subsystem's hook into the migration stream.
pub trait SaveStateHandler: Send {
    fn name(&self) -> &str;

    fn setup(&mut self, stream: &mut SendStream) -> Result<(), MigrationError>;

    /// One bounded pass; returns `true` when the host should call
    /// `complete` on the next round (convergence reached).
    fn iterate(&mut self, stream: &mut SendStream) -> Result<bool, MigrationError>;

    fn complete(&mut self, stream: &mut SendStream) -> Result<(), MigrationError>;

    fn load(&mut self, stream: &mut RecvStream, version_id: u32) -> Result<(), MigrationError>;

    fn cancel(&mut self);
}

/// Ordered set of handlers. Registration order is the dispatch order on
/// both send and load; the RAM handler is registered first by convention
/// (enforced by the driver constructor, not by this registry).
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: Vec<Box<dyn SaveStateHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    pub fn register(&mut self, handler: Box<dyn SaveStateHandler>) {
        self.handlers.push(handler);
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn setup_all(&mut self, stream: &mut SendStream) -> Result<(), MigrationError> {
        for handler in self.handlers.iter_mut() {
            handler.setup(stream)?;
        }
        Ok(())
    }

    /// Returns `true` only once every handler has signaled convergence.
    pub fn iterate_all(&mut self, stream: &mut SendStream) -> Result<bool, MigrationError> {
        let mut all_converged = true;
        for handler in self.handlers.iter_mut() {
            if !handler.iterate(stream)? {
                all_converged = false;
            }
        }
        Ok(all_converged)
    }

    pub fn complete_all(&mut self, stream: &mut SendStream) -> Result<(), MigrationError> {
        for handler in self.handlers.iter_mut() {
            handler.complete(stream)?;
        }
        Ok(())
    }

    pub fn cancel_all(&mut self) {
        for handler in self.handlers.iter_mut() {
            handler.cancel();
        }
    }

    pub fn load_all(
        &mut self,
        stream: &mut RecvStream,
        version_id: u32,
    ) -> Result<(), MigrationError> {
        for handler in self.handlers.iter_mut() {
            handler.load(stream, version_id)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RecordingHandler {
        name: String,
        log: std::sync::Arc<std::sync::Mutex<Vec<String>>>,
        converged: bool,
    }

    impl SaveStateHandler for RecordingHandler {
        fn name(&self) -> &str {
            &self.name
        }
        fn setup(&mut self, _stream: &mut SendStream) -> Result<(), MigrationError> {
            self.log.lock().unwrap().push(format!("{}:setup", self.name));
            Ok(())
        }
        fn iterate(&mut self, _stream: &mut SendStream) -> Result<bool, MigrationError> {
            self.log.lock().unwrap().push(format!("{}:iterate", self.name));
            Ok(self.converged)
        }
        fn complete(&mut self, _stream: &mut SendStream) -> Result<(), MigrationError> {
            self.log.lock().unwrap().push(format!("{}:complete", self.name));
            Ok(())
        }
        fn load(&mut self, _stream: &mut RecvStream, _version_id: u32) -> Result<(), MigrationError> {
            Ok(())
        }
        fn cancel(&mut self) {
            self.log.lock().unwrap().push(format!("{}:cancel", self.name));
        }
    }

    fn send_stream() -> SendStream {
        MigrationStream::new(Box::new(Vec::new()) as Box<dyn Write + Send>, 0)
    }

    #[test]
    fn handlers_run_in_registration_order() {
        let log = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut registry = HandlerRegistry::new();
        registry.register(Box::new(RecordingHandler {
            name: "ram".to_string(),
            log: log.clone(),
            converged: true,
        }));
        registry.register(Box::new(RecordingHandler {
            name: "nic".to_string(),
            log: log.clone(),
            converged: true,
        }));

        let mut stream = send_stream();
        registry.setup_all(&mut stream).unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["ram:setup", "nic:setup"]);
    }

    #[test]
    fn iterate_all_requires_every_handler_to_converge() {
        let log = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut registry = HandlerRegistry::new();
        registry.register(Box::new(RecordingHandler {
            name: "ram".to_string(),
            log: log.clone(),
            converged: true,
        }));
        registry.register(Box::new(RecordingHandler {
            name: "nic".to_string(),
            log: log.clone(),
            converged: false,
        }));

        let mut stream = send_stream();
        assert!(!registry.iterate_all(&mut stream).unwrap());
    }
}
