//! Binlog 처리 위치 추적
//!
//! Binlog 파일명 + 위치로 정확한 재시작 지점을 추적합니다.
//! 예: "mysql-bin.000003" 파일의 4097 바이트 위치

use crate::binlog_file::ParsedFileName;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Binlog 파일은 4 바이트 매직 헤더로 시작하므로 첫 이벤트는 항상 4에 위치
pub const BINLOG_START_POSITION: u64 = 4;

/// Binlog 파일 위치 정보
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BinlogPosition {
    /// 바이너리 로그 파일명 (e.g., "mysql-bin.000001")
    pub filename: String,
    /// 바이트 위치
    pub position: u64,
}

impl BinlogPosition {
    pub fn new(filename: impl Into<String>, position: u64) -> Self {
        BinlogPosition {
            filename: filename.into(),
            position,
        }
    }

    /// 파일의 첫 이벤트 위치
    pub fn start_of(filename: impl Into<String>) -> Self {
        Self::new(filename, BINLOG_START_POSITION)
    }

    /// 파일명에서 시퀀스 번호 추출
    pub fn file_sequence(&self) -> Option<u64> {
        ParsedFileName::parse(&self.filename).ok().map(|p| p.seq)
    }

    /// 파일명 순서 비교. 번호 형식이 아닌 이름은 사전순으로 비교합니다.
    pub fn cmp_filename(&self, other_filename: &str) -> Ordering {
        match (
            ParsedFileName::parse(&self.filename),
            ParsedFileName::parse(other_filename),
        ) {
            (Ok(a), Ok(b)) if a.base == b.base => a.seq.cmp(&b.seq),
            _ => self.filename.as_str().cmp(other_filename),
        }
    }
}

impl Ord for BinlogPosition {
    fn cmp(&self, other: &Self) -> Ordering {
        self.cmp_filename(&other.filename)
            .then_with(|| self.filename.cmp(&other.filename))
            .then_with(|| self.position.cmp(&other.position))
    }
}

impl PartialOrd for BinlogPosition {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for BinlogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.filename, self.position)
    }
}
