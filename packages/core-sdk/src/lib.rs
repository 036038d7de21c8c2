pub mod config;
pub mod db;
pub mod models;
pub mod poe;
pub mod registry;
pub mod sink;
pub mod telemetry;
pub mod vendor;

/**
 * \brief SDK 预导入集合，方便外部引用常用类型。
 */
pub mod prelude {
    pub use crate::config::{Configurable, SetupQuestion, Settings};
    pub use crate::models::{ChatOptions, Message};
    pub use crate::poe::{PoeClient, PoeVendor, Timeouts};
    pub use crate::registry::VendorRegistry;
    pub use crate::sink::{chunk_channel, ChannelSink, ChunkReceiver, ChunkSink, StreamFailure};
    pub use crate::vendor::{
        HasSetupQuestions, Operation, SupportsListModels, SupportsSend, SupportsSendStream,
        Vendor, VendorError,
    };
}
