//! Binlog 리더 관련 에러 타입

use std::io;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CdcError {
    #[error("유효하지 않은 인자: {0}")]
    InvalidArgument(String),

    #[error("binlog reader가 이미 실행 중입니다")]
    AlreadyRunning,

    #[error("binlog reader가 이미 종료되었습니다")]
    Closed,

    #[error("tokio 런타임 안에서 호출해야 합니다: {0}")]
    RuntimeUnavailable(String),

    #[error("I/O 에러: {0}")]
    IoError(String),

    #[error("찾을 수 없음: {0}")]
    NotFound(String),

    #[error("형식 에러: {0}")]
    FormatError(String),

    #[error("Binlog 디코딩 에러: {0}")]
    DecodeError(String),

    #[error("처리 중 패닉 복구: {message}\n{trace}")]
    FaultRecovered { message: String, trace: String },

    #[error("작업이 취소되었습니다")]
    Canceled,

    #[error("Timeout 에러")]
    Timeout,

    #[error("채널이 닫혔습니다")]
    ChannelClosed,
}

impl CdcError {
    /// 재시도로 회복될 수 있는 I/O 계열 에러인지 여부
    pub fn is_transient(&self) -> bool {
        matches!(self, CdcError::IoError(_) | CdcError::NotFound(_))
    }
}

impl From<io::Error> for CdcError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => CdcError::NotFound(err.to_string()),
            _ => CdcError::IoError(err.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, CdcError>;
