pub use crate::addr::Endpoint;
pub use crate::api::Context;
pub use crate::app::{AppId, Application};
pub use crate::factory::{Factory, Properties, Router, Services};
pub use crate::ifaddr::IfaceAddr;
pub use crate::kernel::{downcast, ExitCode, Flags, Header, Kernel, KernelBox, KernelId, Link, Phase};
pub use crate::kernel_cast;
pub use crate::registry::InstanceRegistry;
pub use crate::types::TypeRegistry;
