pub mod linked_list;
pub mod lru_list;

pub use linked_list::{Element, Iter, LinkedList};
pub use lru_list::{LruElement, LruList};
