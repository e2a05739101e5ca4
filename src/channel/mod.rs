//! 通道层：适配器契约、注册表、路由与内置适配器

pub mod registry;
pub mod router;
pub mod scripted;
pub mod traits;

#[cfg(feature = "browser")]
pub mod browser;

pub use registry::ChannelRegistry;
pub use router::AdapterRouter;
pub use scripted::{ReadyStep, ScriptedAdapter};
pub use traits::{ChannelAdapter, ChannelError, ChannelHandle, ChannelLost};

#[cfg(feature = "browser")]
pub use browser::{BrowserAdapter, ProviderProfile};
