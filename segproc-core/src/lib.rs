//! Pooled, segmented event processor: a concurrent coordination substrate
//! over an external token store, message source, event validator, and
//! batch processor. See `Coordinator` and `WorkPackage` for the entry
//! points.

pub mod batch_processor;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod event;
pub mod executor;
pub mod message_source;
pub mod segment;
pub mod status;
pub mod token;
pub mod token_store;
pub mod validator;
pub mod work_package;

pub use batch_processor::{BatchProcessor, UnitOfWork};
pub use config::{Configuration, ConfigurationBuilder, InitialTokenFn};
pub use coordinator::Coordinator;
pub use error::{AbortCause, ProcessorError};
pub use event::EventMessage;
pub use executor::{TaskExecutor, TokioExecutor};
pub use message_source::{EventStream, InMemoryMessageSource, MessageSource};
pub use segment::Segment;
pub use status::{StatusRegistry, TrackerStatus};
pub use token::GlobalSequenceToken;
pub use token_store::{InMemoryTokenStore, TokenStore};
pub use validator::{EventValidator, SegmentMatchValidator};
pub use work_package::WorkPackage;
