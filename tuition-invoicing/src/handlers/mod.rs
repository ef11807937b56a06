pub mod line_items;

pub use line_items::{get_line_items, recompute_total, save_line_items};
