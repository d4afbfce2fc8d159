use crate::{config::IceConfig, room::RoomDirectory};

/// Shared by every HTTP and WebSocket handler.
#[derive(Clone, Default)]
pub struct AppState {
    pub directory: RoomDirectory,
    pub ice: IceConfig,
}

impl AppState {
    pub fn new(ice: IceConfig) -> Self {
        Self {
            directory: RoomDirectory::new(),
            ice,
        }
    }
}
