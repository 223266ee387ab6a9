pub mod manager;
pub mod mmio;
pub mod uvm;

// Re-export the main types for easy access
pub use manager::{Allocation, HeapRequest, HeapType};
pub use mmio::MmioRegion;
pub use uvm::{UvmSession, UvmStage};
