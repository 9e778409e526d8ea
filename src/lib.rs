pub mod config;
pub mod server;
pub mod session;
pub mod signal;
pub mod webrtc;

pub use config::{get_config_path, get_duet_dir, Config};
pub use server::{RelayServer, RelayState};
pub use session::{Session, SessionEvent, SessionField, SessionOptions, SessionSnapshot, Subscription};
pub use signal::{HttpSignaling, SignalKind, SignalTransport, TransportFactory};
pub use signal_store::{NewSignal, Signal, SignalStore, StoreOptions};
pub use webrtc::{CallStatus, LoopbackNetwork, MediaStream, TrackKind, WebRtcConfig, WebRtcHostFactory};
