pub mod capabilities;
pub mod completion;
pub mod config;
pub mod driver;
pub mod error;
pub mod observability;
pub mod protocol;
pub mod state;
pub mod store;
pub mod stream;
pub mod transport;

mod util;

pub use util::generate_chat_id;
