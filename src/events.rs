//! MySQL Binlog 이벤트 타입 및 데이터 구조 정의
//!
//! 이벤트 본문은 ROTATE와 FORMAT_DESCRIPTION만 디코딩하고
//! 나머지는 그대로 전달합니다.

use crate::error::Result;
use byteorder::{LittleEndian, WriteBytesExt};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;

/// 이벤트 헤더 크기 (v4)
pub const EVENT_HEADER_SIZE: usize = 19;

/// 서버가 아닌 리더가 만들어낸 이벤트 표시 플래그
pub const LOG_EVENT_ARTIFICIAL_F: u16 = 0x0020;

/// MySQL Binlog 이벤트 타입
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum EventType {
    /// 알 수 없는 이벤트
    Unknown = 0,
    /// 쿼리 이벤트 (DDL, BEGIN)
    QueryEvent = 2,
    /// 서버 정지
    StopEvent = 3,
    /// 로테이션 이벤트 (새 binlog 파일)
    RotateEvent = 4,
    /// 파일 포맷 정보 (항상 파일의 첫 이벤트)
    FormatDescriptionEvent = 15,
    /// 트랜잭션 커밋
    XidEvent = 16,
    /// 테이블 맵 이벤트 (스키마 정보)
    TableMapEvent = 19,
    HeartbeatLogEvent = 27,
    /// Rows Query 이벤트 (원본 쿼리)
    RowsQueryEvent = 29,
    /// WRITE_ROWS 이벤트 (INSERT)
    WriteRowsEvent = 30,
    /// UPDATE_ROWS 이벤트 (UPDATE)
    UpdateRowsEvent = 31,
    /// DELETE_ROWS 이벤트 (DELETE)
    DeleteRowsEvent = 32,
    /// GTID 이벤트 (Global Transaction ID)
    GtidEvent = 33,
    /// 익명 GTID 이벤트
    AnonymousGtidEvent = 34,
    PreviousGtidsEvent = 35,
    /// 트랜잭션 페이로드 이벤트
    TransactionPayloadEvent = 40,
}

impl EventType {
    pub fn from_u8(val: u8) -> Self {
        match val {
            2 => EventType::QueryEvent,
            3 => EventType::StopEvent,
            4 => EventType::RotateEvent,
            15 => EventType::FormatDescriptionEvent,
            16 => EventType::XidEvent,
            19 => EventType::TableMapEvent,
            27 => EventType::HeartbeatLogEvent,
            29 => EventType::RowsQueryEvent,
            30 => EventType::WriteRowsEvent,
            31 => EventType::UpdateRowsEvent,
            32 => EventType::DeleteRowsEvent,
            33 => EventType::GtidEvent,
            34 => EventType::AnonymousGtidEvent,
            35 => EventType::PreviousGtidsEvent,
            40 => EventType::TransactionPayloadEvent,
            _ => EventType::Unknown,
        }
    }
}

/// Binlog 이벤트 헤더
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventHeader {
    /// 이벤트 타임스탬프 (초 단위)
    pub timestamp: u32,
    /// 이벤트 타입
    pub event_type: EventType,
    /// 원시 타입 코드 (Unknown인 경우에도 보존)
    pub type_code: u8,
    /// MySQL 서버 ID
    pub server_id: u32,
    /// 이벤트 길이 (헤더와 체크섬 포함)
    pub event_length: u32,
    /// 다음 이벤트 위치
    pub next_pos: u32,
    /// 이벤트 플래그
    pub flags: u16,
}

impl EventHeader {
    pub fn datetime(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(i64::from(self.timestamp), 0)
    }

    /// 리더가 합성한 이벤트인지 여부
    pub fn is_artificial(&self) -> bool {
        self.flags & LOG_EVENT_ARTIFICIAL_F != 0
    }
}

/// 회전 이벤트 데이터
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotateEventData {
    /// 새 바이너리 로그 파일명
    pub next_binlog_name: String,
    /// 새 파일의 시작 위치
    pub position: u64,
}

/// FORMAT_DESCRIPTION 이벤트 데이터
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatDescriptionData {
    pub binlog_version: u16,
    pub server_version: String,
    pub create_timestamp: u32,
    pub header_length: u8,
    /// 0 = NONE, 1 = CRC32
    pub checksum_alg: u8,
}

/// 디코딩된 이벤트 본문
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinlogEventData {
    Rotate(RotateEventData),
    FormatDescription(FormatDescriptionData),
    /// 본문 해석은 하위 단계의 몫
    Opaque,
}

/// 완성된 Binlog 이벤트
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinlogEvent {
    /// 이벤트 헤더
    pub header: EventHeader,
    /// 이벤트 데이터
    pub data: BinlogEventData,
    /// 헤더와 체크섬을 뺀 본문
    #[serde(skip)]
    pub payload: Bytes,
    /// 헤더부터 체크섬까지 원본 바이트
    #[serde(skip)]
    pub raw: Bytes,
}

impl BinlogEvent {
    pub fn event_type(&self) -> EventType {
        self.header.event_type
    }

    pub fn rotate(&self) -> Option<&RotateEventData> {
        match &self.data {
            BinlogEventData::Rotate(rotate) => Some(rotate),
            _ => None,
        }
    }
}

/// 파일 경계를 넘을 때 보낼 가짜 ROTATE 이벤트 생성
///
/// MySQL 서버가 binlog 파일을 보내기 전에 만드는 이벤트와 같은 모양입니다:
/// 타임스탬프와 log position은 0, 플래그는 `LOG_EVENT_ARTIFICIAL_F`.
pub fn fake_rotate_event(next_log_name: &str, position: u64, server_id: u32) -> Result<BinlogEvent> {
    let body_len = 8 + next_log_name.len();
    let event_length = EVENT_HEADER_SIZE + body_len;

    let mut raw = Vec::with_capacity(event_length);
    raw.write_u32::<LittleEndian>(0)?;
    raw.write_u8(EventType::RotateEvent as u8)?;
    raw.write_u32::<LittleEndian>(server_id)?;
    raw.write_u32::<LittleEndian>(event_length as u32)?;
    raw.write_u32::<LittleEndian>(0)?;
    raw.write_u16::<LittleEndian>(LOG_EVENT_ARTIFICIAL_F)?;
    raw.write_u64::<LittleEndian>(position)?;
    raw.write_all(next_log_name.as_bytes())?;

    let raw = Bytes::from(raw);
    Ok(BinlogEvent {
        header: EventHeader {
            timestamp: 0,
            event_type: EventType::RotateEvent,
            type_code: EventType::RotateEvent as u8,
            server_id,
            event_length: event_length as u32,
            next_pos: 0,
            flags: LOG_EVENT_ARTIFICIAL_F,
        },
        data: BinlogEventData::Rotate(RotateEventData {
            next_binlog_name: next_log_name.to_string(),
            position,
        }),
        payload: raw.slice(EVENT_HEADER_SIZE..),
        raw,
    })
}
