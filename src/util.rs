use std::path::PathBuf;

const DEFAULT_AGENT_PORT: u16 = 2345;

pub fn get_default_agent_port() -> u16 {
    DEFAULT_AGENT_PORT
}

const DATABASE_PATH: &str = "FLEETWATCH_DATABASE";

pub fn get_database_path() -> Option<PathBuf> {
    std::env::var(DATABASE_PATH)
        .ok()
        .filter(|path| !path.is_empty())
        .map(PathBuf::from)
}

const SOCKET_PATH: &str = "FLEETWATCH_SOCKET";

pub fn get_socket_path() -> Option<PathBuf> {
    std::env::var(SOCKET_PATH)
        .ok()
        .filter(|path| !path.is_empty())
        .map(PathBuf::from)
}
