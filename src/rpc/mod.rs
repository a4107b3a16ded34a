mod handler;
mod methods;
pub mod types;

pub use self::handler::{handle_websocket, process_message};
pub use self::methods::RpcMethods;
