//! 테스트용 binlog 파일 생성기

use crate::binlog::BINLOG_MAGIC;
use crate::events::{EventType, EVENT_HEADER_SIZE};
use byteorder::{LittleEndian, WriteBytesExt};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

pub(crate) struct BinlogFileBuilder {
    buf: Vec<u8>,
    server_id: u32,
    checksum: bool,
}

impl BinlogFileBuilder {
    /// 매직 헤더와 FORMAT_DESCRIPTION 이벤트로 시작하는 파일
    pub fn new(server_id: u32, checksum: bool) -> Self {
        let mut builder = BinlogFileBuilder {
            buf: BINLOG_MAGIC.to_vec(),
            server_id,
            checksum,
        };

        let mut body = Vec::new();
        body.write_u16::<LittleEndian>(4).unwrap();
        let mut version = [0u8; 50];
        version[..10].copy_from_slice(b"5.7.30-log");
        body.extend_from_slice(&version);
        body.write_u32::<LittleEndian>(1_600_000_000).unwrap();
        body.write_u8(EVENT_HEADER_SIZE as u8).unwrap();
        body.extend_from_slice(&[0u8; 38]);
        body.write_u8(u8::from(checksum)).unwrap();
        if !checksum {
            // 체크섬을 끈 서버도 FORMAT_DESCRIPTION에는 체크섬 자리를 남김
            body.extend_from_slice(&[0u8; 4]);
        }
        builder.push(EventType::FormatDescriptionEvent as u8, &body);
        builder
    }

    /// 이벤트를 추가하고 다음 이벤트 위치(log_pos) 반환
    pub fn push(&mut self, type_code: u8, body: &[u8]) -> u64 {
        let checksum_len = if self.checksum { 4 } else { 0 };
        let event_length = EVENT_HEADER_SIZE + body.len() + checksum_len;
        let next_pos = self.buf.len() + event_length;

        let start = self.buf.len();
        self.buf.write_u32::<LittleEndian>(1_600_000_000).unwrap();
        self.buf.write_u8(type_code).unwrap();
        self.buf.write_u32::<LittleEndian>(self.server_id).unwrap();
        self.buf.write_u32::<LittleEndian>(event_length as u32).unwrap();
        self.buf.write_u32::<LittleEndian>(next_pos as u32).unwrap();
        self.buf.write_u16::<LittleEndian>(0).unwrap();
        self.buf.extend_from_slice(body);
        if self.checksum {
            let crc = crc32fast::hash(&self.buf[start..]);
            self.buf.write_u32::<LittleEndian>(crc).unwrap();
        }

        next_pos as u64
    }

    pub fn query(&mut self, sql: &str) -> u64 {
        self.push(EventType::QueryEvent as u8, sql.as_bytes())
    }

    pub fn xid(&mut self, xid: u64) -> u64 {
        self.push(EventType::XidEvent as u8, &xid.to_le_bytes())
    }

    pub fn rotate(&mut self, next: &str, position: u64) -> u64 {
        let mut body = position.to_le_bytes().to_vec();
        body.extend_from_slice(next.as_bytes());
        self.push(EventType::RotateEvent as u8, &body)
    }

    /// 현재 파일 길이 (= 다음 이벤트 위치)
    pub fn position(&self) -> u64 {
        self.buf.len() as u64
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn write(&self, dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, &self.buf).unwrap();
        path
    }

    /// `from` 이후에 추가된 바이트만 기존 파일 뒤에 붙임
    pub fn append_since(&self, path: &Path, from: u64) {
        let mut file = OpenOptions::new().append(true).open(path).unwrap();
        file.write_all(&self.buf[from as usize..]).unwrap();
    }
}
