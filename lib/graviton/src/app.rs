use std::path::PathBuf;

pub type AppId = u64;

/// The root (daemon) application.
pub const ROOT_APP: AppId = 0;

/// A user application known to the runtime: a cluster-wide identifier plus
/// the executable that runs it. `wait_for_completion` keeps the daemon alive
/// until the application's main kernel returns.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Application {
    pub id: AppId,
    pub exec_path: PathBuf,
    pub wait_for_completion: bool,
}

impl Application {
    pub fn new<P: Into<PathBuf>>(id: AppId, exec_path: P) -> Application {
        Application {
            id,
            exec_path: exec_path.into(),
            wait_for_completion: true,
        }
    }
}
