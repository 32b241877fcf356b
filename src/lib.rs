//! 로컬 MySQL Binlog 파일 스트리머
//!
//! 디렉토리에 쌓이는 binlog 파일을 순서대로 읽어 하나의 이벤트 스트림으로 전달합니다.
//! 주요 기능:
//! - 파일명 시퀀스 기반 파일 목록 수집
//! - 파일 경계를 넘는 위치(체크포인트) 추적과 재시작
//! - 가짜 ROTATE 이벤트 합성
//! - 취소 가능한 전달과 tailing

pub mod binlog;
pub mod binlog_file;
pub mod error;
pub mod events;
pub mod offset;
pub mod reader;
pub mod streamer;

#[cfg(test)]
pub(crate) mod testing;

pub use binlog::{BinlogFileParser, BinlogParser, ParserConfig, TailMode};
pub use binlog_file::{collect_binlog_files, ParsedFileName};
pub use error::{CdcError, Result};
pub use events::{BinlogEvent, BinlogEventData, EventHeader, EventType};
pub use offset::BinlogPosition;
pub use reader::{BinlogReader, BinlogReaderConfig, ReaderState};
pub use streamer::Streamer;
