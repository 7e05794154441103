pub mod assembly;
pub mod error;
pub mod media;
pub mod queue;
pub mod relay;
pub mod server;
pub mod session;
pub mod signaling;
pub mod source;
pub mod streamer;
pub mod telemetry;
pub mod transport;
pub mod wire;

pub use assembly::{AssemblyConfig, CompletedFrame, FragmentAssembler};
pub use error::{Result, StreamError};
pub use media::{EncodedFrame, SourceFrame};
pub use queue::BoundedFrameQueue;
pub use relay::RelayConnection;
pub use server::{Server, ServerConfig};
pub use session::{BandwidthEstimate, SessionRegistry, ViewerSession};
pub use source::{FrameSource, SourceKind};
pub use streamer::Streamer;
