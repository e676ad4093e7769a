pub mod chat;
pub mod health;

pub use chat::{
    capture_handler, chat_handler, consent_handler, flow_config_handler, flow_state_handler,
};
pub use health::health_check;
