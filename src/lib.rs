//! An embedded B+-tree index engine for NOR/dataflash storage.
//!
//! See `Tree` for the public entry point. The crate has no process-global
//! state: every operation is a method on an owned `Tree` value.

pub mod bitarr;
pub mod buffer_pool;
pub mod error;
pub mod mapping;
pub mod page;
pub mod storage;
pub mod tree;

pub use error::{Result, VmtreeError};
pub use page::Mode;
pub use storage::{BlockDevice, FileBlockDevice, MemoryBlockDevice};
pub use tree::{Comparator, Tree, TreeIterator};

/// Configuration accepted by `Tree::init`, mirroring the parameter list in
/// the Tree API surface and the teacher's constructor-parameter style
/// (`BTreeTable::new`).
#[derive(Debug, Clone)]
pub struct TreeParams {
    pub page_size: u16,
    pub num_buffer_pages: u16,
    pub erase_size_in_pages: u16,
    pub key_size: u16,
    pub data_size: u16,
    pub mapping_buffer_size: u16,
    pub mode: Mode,
    pub storage_size_pages: u32,
}

impl TreeParams {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.key_size == 0 || self.data_size == 0 {
            return Err(VmtreeError::Invariant(
                "key_size and data_size must be nonzero".into(),
            ));
        }
        if self.num_buffer_pages < 2 {
            return Err(VmtreeError::Invariant(
                "num_buffer_pages must be at least 2".into(),
            ));
        }
        if self.erase_size_in_pages == 0 {
            return Err(VmtreeError::Invariant(
                "erase_size_in_pages must be at least 1".into(),
            ));
        }
        if self.storage_size_pages < self.erase_size_in_pages as u32 * 2 {
            return Err(VmtreeError::Invariant(
                "storage_size_pages must hold at least two erase blocks".into(),
            ));
        }
        Ok(())
    }
}

/// Initializes the `log`/`env_logger` facade for tests and benchmarks,
/// grounded in the teacher's `init_log` (`small_db::utils::init_log`).
/// Engine code itself never prints; it only emits through `log`'s macros.
pub fn init_log() {
    use env_logger::Builder;
    use std::io::Write;
    use std::sync::Once;

    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let mut builder = Builder::from_default_env();
        builder
            .format_timestamp_micros()
            .format(|buf, record| {
                writeln!(
                    buf,
                    "[{} {}] {}",
                    record.level(),
                    record.target(),
                    record.args()
                )
            })
            .init();
    });
}
