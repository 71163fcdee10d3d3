//! Shared-library loading.
//!
//! [`parse_dylink`] reads the libraries a module declares as needed;
//! [`LibraryLoadPlanner`] turns an install's [`SharedLibraryInventory`]
//! into an ordered plan and drives a [`DynamicLoader`] through it.
//!
//! [`SharedLibraryInventory`]: crate::installer::SharedLibraryInventory

mod dylink;
mod planner;

pub use dylink::{parse_dylink, DylinkError, DylinkInfo, DylinkResult};
pub use planner::{
    order_globals_first, DynamicLoader, LibraryLoadPlanner, LoadError, LoadOptions, LoadReport,
    PlannedLibrary,
};
