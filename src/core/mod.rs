pub mod capture;
pub mod codec;
pub mod devices;
pub mod playback;
pub mod session;
pub mod transcript;
pub mod transport;

// Re-export commonly used types for convenience
pub use capture::{CaptureConfig, CapturePipeline, CaptureStats, LoudnessMeter};

pub use codec::{AudioFrame, CodecError, CodecResult, EncodedChunk};

pub use devices::{
    DeviceError, DeviceResult, MicrophoneProvider, OutputDevice, OutputDeviceProvider,
};

pub use playback::{PlaybackItem, PlaybackScheduler};

pub use session::{SessionConfig, SessionNotice, SessionState, VoiceSession};

pub use transcript::{TranscriptAccumulator, TranscriptSnapshot};

pub use transport::{
    BaseTransport, BoxedTransport, GeminiLive, GeminiLiveFactory, InboundEvent, Speaker,
    TransportConfig, TransportError, TransportFactory, TransportProvider, TransportResult,
    create_transport_factory, get_supported_transport_providers,
};
