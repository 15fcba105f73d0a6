pub mod logging;
pub mod shared;
pub mod time;
pub mod util;
