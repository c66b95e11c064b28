//! Asynchronous Siemens S7 communication client over ISO-on-TCP (RFC 1006).
//!
//! Talks to S7-300/400/1200/1500 controllers: reads and writes variables in
//! any memory area, plans optimized grouped reads, enumerates and uploads
//! program blocks, queries system status lists and the controller clock.
//!
//! ```no_run
//! use s7link::{EndpointOptions, ItemGroup, S7Endpoint};
//!
//! # async fn demo() -> s7link::Result<()> {
//! let endpoint = S7Endpoint::new(EndpointOptions {
//!     host: "192.168.0.10".into(),
//!     rack: 0,
//!     slot: 1,
//!     ..Default::default()
//! });
//! endpoint.connect().await?;
//!
//! let mut group = ItemGroup::new(endpoint.clone());
//! group.add_items(["DB1,REAL0", "DB1,INT4", "M10.3"])?;
//! let values = group.read_all_items().await?;
//! println!("{values:?}");
//! # Ok(())
//! # }
//! ```

pub mod endpoint;
pub mod group;
pub mod item;
pub mod protocol;

pub use endpoint::{
    ComponentIdent, EndpointEvent, EndpointOptions, ModuleIdent, S7Endpoint, SslResponse,
    TransportFactory,
};
pub use group::ItemGroup;
pub use item::{Item, ItemValue};
pub use protocol::error::{Error, ErrorKind, Result};
pub use protocol::frame::types::{BlockType, MemoryArea, ReturnCode, Transport};
pub use protocol::frame::{parse_tag, ParsedTag, TagAddress, ValueKind};
pub use protocol::session::{
    BlockListEntry, ConnectionState, Duplex, ReadResult, S7Connection, SessionConfig,
};
