//! Binlog 파일명 파싱 및 파일 목록 수집
//!
//! 파일명 형식: `<base>.<0으로 채운 숫자>` (예: "mysql-bin.000003")
//! 같은 base를 가진 파일들을 시퀀스 번호 순으로 정렬하여 반환합니다.

use crate::error::{CdcError, Result};
use regex::Regex;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::OnceLock;
use tracing::debug;

fn file_name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(.+)\.(\d+)$").expect("valid binlog file name regex"))
}

/// 파싱된 binlog 파일명
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedFileName {
    /// 파일 family 이름 (e.g., "mysql-bin")
    pub base: String,
    /// 시퀀스 번호 (e.g., 3)
    pub seq: u64,
}

impl ParsedFileName {
    pub fn parse(filename: &str) -> Result<Self> {
        let caps = file_name_regex().captures(filename).ok_or_else(|| {
            CdcError::FormatError(format!("binlog 파일명 형식이 아닙니다: {}", filename))
        })?;

        let seq = caps[2].parse::<u64>().map_err(|e| {
            CdcError::FormatError(format!("잘못된 시퀀스 번호 {}: {}", filename, e))
        })?;

        Ok(ParsedFileName {
            base: caps[1].to_string(),
            seq,
        })
    }

    /// 시퀀스 번호만 비교 (base는 같다고 가정)
    pub fn equal(&self, other: &ParsedFileName) -> bool {
        self.seq == other.seq
    }

    pub fn bigger_or_equal_than(&self, other: &ParsedFileName) -> bool {
        self.seq >= other.seq
    }
}

/// `dir`에서 `first_file`과 같은 family이고 시퀀스가 같거나 큰 파일들을 오름차순으로 반환
pub fn collect_binlog_files(dir: &Path, first_file: &str) -> Result<Vec<String>> {
    if dir.as_os_str().is_empty() {
        return Err(CdcError::InvalidArgument(
            "binlog 디렉토리가 비어 있습니다".to_string(),
        ));
    }

    let first = ParsedFileName::parse(first_file)?;

    let entries = fs::read_dir(dir).map_err(|e| match CdcError::from(e) {
        CdcError::NotFound(msg) => CdcError::NotFound(format!("{}: {}", dir.display(), msg)),
        CdcError::IoError(msg) => CdcError::IoError(format!("{}: {}", dir.display(), msg)),
        other => other,
    })?;

    let mut files: Vec<(u64, String)> = Vec::new();
    for entry in entries {
        // 목록을 읽는 사이 purge 등으로 지워진 파일은 건너뜀
        let entry = match skip_vanished(entry)? {
            Some(entry) => entry,
            None => continue,
        };
        let file_type = match skip_vanished(entry.file_type())? {
            Some(file_type) => file_type,
            None => {
                debug!("Ignoring vanished entry {:?}", entry.file_name());
                continue;
            }
        };
        if !file_type.is_file() {
            continue;
        }

        let name = match entry.file_name().into_string() {
            Ok(name) => name,
            Err(_) => continue,
        };

        let parsed = match ParsedFileName::parse(&name) {
            Ok(parsed) => parsed,
            Err(_) => {
                debug!("Ignoring non-binlog file {}", name);
                continue;
            }
        };

        if parsed.base != first.base || !parsed.bigger_or_equal_than(&first) {
            continue;
        }

        files.push((parsed.seq, name));
    }

    files.sort();
    Ok(files.into_iter().map(|(_, name)| name).collect())
}

fn skip_vanished<T>(result: io::Result<T>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}
