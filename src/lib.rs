pub mod collection;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod ids;
pub mod primitive;
pub mod reader;
pub mod reftable;
pub mod session;
pub mod surrogate;
pub mod value;
pub mod writer;

pub use config::{ReferencePreservation, SerializationMethod, SessionOptions, VersionTolerance};
pub use error::{ReadError, WriteError};
pub use reader::ObjectReader;
pub use session::Session;
pub use value::{Field, GraphObject, GraphRef, LegacyContract, TypeRegistry, XmlContract};
pub use writer::ObjectWriter;
