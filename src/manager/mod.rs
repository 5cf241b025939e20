//! Socket ownership above the packet filters.

mod iface_mgr;

pub use iface_mgr::IfaceMgr;
