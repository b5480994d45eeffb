mod window_store;

pub use window_store::{StateBudget, WindowStateStore};
