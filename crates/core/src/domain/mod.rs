pub mod catalog;
pub mod contract;
pub mod expense;
pub mod recommendation;
