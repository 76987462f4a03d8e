use std::io;

/// 内核侧错误分类 / Kernel-side error taxonomy.
///
/// `Connection` aborts the kernel work of one answer set only; `Kernel` is
/// local to one (record, target) pair and poisons the owning session.
#[derive(Debug, thiserror::Error)]
pub enum NftError {
    #[error("open nftables connection: {0}")]
    Connection(io::Error),

    #[error("nftables {op}: {source}")]
    Kernel {
        op: &'static str,
        source: io::Error,
    },
}

impl NftError {
    pub fn kernel(op: &'static str, source: io::Error) -> Self {
        NftError::Kernel { op, source }
    }

    pub fn is_connection(&self) -> bool {
        matches!(self, NftError::Connection(_))
    }
}

pub type Result<T> = std::result::Result<T, NftError>;
