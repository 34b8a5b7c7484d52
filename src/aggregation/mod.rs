mod controller;
mod counter;
mod layout;

pub use controller::AggregationController;
pub use counter::AggregationCounter;
pub use layout::SlotLayout;
