//! MySQL Binlog 파일 파서
//!
//! Binlog 파일의 바이너리 형식을 파싱합니다.
//! 헤더: 4 바이트 매직 넘버 (0xfe 0x62 0x69 0x6e)
//! 각 이벤트:
//!   - Timestamp (4 bytes)
//!   - Type (1 byte)
//!   - Server ID (4 bytes)
//!   - Event Length (4 bytes)
//!   - Next Position (4 bytes)
//!   - Flags (2 bytes)
//!   - Event Data (variable)
//!   - CRC32 (4 bytes, FORMAT_DESCRIPTION에서 활성화된 경우)

use crate::error::{CdcError, Result};
use crate::events::*;
use crate::offset::BINLOG_START_POSITION;
use byteorder::{LittleEndian, ReadBytesExt};
use bytes::Bytes;
use std::fs::File;
use std::io::{self, BufReader, Cursor, Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, trace};

pub const BINLOG_MAGIC: &[u8] = &[0xfe, 0x62, 0x69, 0x6e]; // ".bin" in ASCII

const CHECKSUM_SIZE: usize = 4;
const CHECKSUM_ALG_CRC32: u8 = 1;
const SERVER_VERSION_LENGTH: usize = 50;
/// binlog_version(2) + server_version(50) + create_timestamp(4) + header_length(1)
const FORMAT_DESCRIPTION_MIN_LENGTH: usize = 2 + SERVER_VERSION_LENGTH + 4 + 1;
/// max_allowed_packet 상한 (1GiB)
const MAX_EVENT_LENGTH: u32 = 1 << 30;

/// 이벤트 콜백 타입
pub type OnEvent<'a> = dyn FnMut(BinlogEvent) -> Result<()> + 'a;

/// 파일 끝에서 잘린 이벤트를 만났을 때의 처리 방식
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TailMode {
    /// 디렉토리의 마지막 파일. 아직 쓰는 중일 수 있으므로 마지막 완전한 이벤트에서 멈춤
    Growing,
    /// 뒤에 새 파일이 있는 파일. 잘린 이벤트는 디코딩 에러
    Sealed,
}

/// 파일 단위 binlog 디코더
///
/// `parse_file`은 `offset`부터 파일 끝까지 이벤트마다 `on_event`를 동기적으로 호출하고,
/// 첫 번째 I/O, 디코딩, 콜백 에러를 그대로 반환합니다.
pub trait BinlogFileParser: Send + Sync {
    fn parse_file(
        &self,
        path: &Path,
        offset: u64,
        tail: TailMode,
        on_event: &mut OnEvent<'_>,
    ) -> Result<()>;

    /// 진행 중인 파싱을 다음 이벤트 경계에서 멈춤 (best-effort)
    fn stop(&self);
}

/// 파서 생성 시 한 번 정하는 디코딩 옵션
#[derive(Debug, Clone)]
pub struct ParserConfig {
    /// CRC32 체크섬 검증 여부
    pub verify_checksum: bool,
}

impl Default for ParserConfig {
    fn default() -> Self {
        ParserConfig {
            verify_checksum: true,
        }
    }
}

/// 기본 Binlog 파일 파서
pub struct BinlogParser {
    config: ParserConfig,
    stopped: AtomicBool,
}

impl Default for BinlogParser {
    fn default() -> Self {
        Self::new(ParserConfig::default())
    }
}

impl BinlogParser {
    pub fn new(config: ParserConfig) -> Self {
        BinlogParser {
            config,
            stopped: AtomicBool::new(false),
        }
    }

    /// Binlog 파일 헤더 검증
    pub fn verify_magic(data: &[u8]) -> Result<()> {
        if data.len() < BINLOG_MAGIC.len() {
            return Err(CdcError::FormatError(
                "Invalid binlog: too short".to_string(),
            ));
        }

        if data[0..4] == BINLOG_MAGIC[..] {
            Ok(())
        } else {
            Err(CdcError::FormatError(format!(
                "Invalid binlog magic number: {:02x?}",
                &data[0..4]
            )))
        }
    }

    /// 이벤트 헤더 파싱
    pub fn parse_header(data: &[u8]) -> Result<EventHeader> {
        if data.len() < EVENT_HEADER_SIZE {
            return Err(CdcError::DecodeError(
                "Invalid event header: too short".to_string(),
            ));
        }

        let mut cursor = Cursor::new(data);

        let timestamp = cursor.read_u32::<LittleEndian>()?;
        let type_code = cursor.read_u8()?;
        let server_id = cursor.read_u32::<LittleEndian>()?;
        let event_length = cursor.read_u32::<LittleEndian>()?;
        let next_pos = cursor.read_u32::<LittleEndian>()?;
        let flags = cursor.read_u16::<LittleEndian>()?;

        Ok(EventHeader {
            timestamp,
            event_type: EventType::from_u8(type_code),
            type_code,
            server_id,
            event_length,
            next_pos,
            flags,
        })
    }

    /// ROTATE 이벤트 파싱 (4)
    pub fn parse_rotate_event(data: &[u8]) -> Result<RotateEventData> {
        if data.len() < 8 {
            return Err(CdcError::DecodeError("Invalid rotate event".to_string()));
        }

        let mut cursor = Cursor::new(data);

        let position = cursor.read_u64::<LittleEndian>()?;
        let filename_bytes = &data[cursor.position() as usize..];
        let filename = String::from_utf8_lossy(filename_bytes).to_string();

        Ok(RotateEventData {
            next_binlog_name: filename,
            position,
        })
    }

    /// FORMAT_DESCRIPTION 이벤트 파싱 (15)
    pub fn parse_format_description(data: &[u8], checksum_alg: u8) -> Result<FormatDescriptionData> {
        if data.len() < FORMAT_DESCRIPTION_MIN_LENGTH {
            return Err(CdcError::DecodeError(format!(
                "Invalid format description event: {} bytes",
                data.len()
            )));
        }

        let mut cursor = Cursor::new(data);

        let binlog_version = cursor.read_u16::<LittleEndian>()?;
        let mut version_bytes = [0u8; SERVER_VERSION_LENGTH];
        cursor.read_exact(&mut version_bytes)?;
        let create_timestamp = cursor.read_u32::<LittleEndian>()?;
        let header_length = cursor.read_u8()?;

        Ok(FormatDescriptionData {
            binlog_version,
            server_version: server_version_string(&version_bytes),
            create_timestamp,
            header_length,
            checksum_alg,
        })
    }

    /// FORMAT_DESCRIPTION 본문(헤더 제외, 체크섬 포함)에서 체크섬 알고리즘 추출
    ///
    /// 5.6.1 이상 서버는 본문 끝에서 5번째 바이트가 checksum_alg 입니다.
    fn detect_checksum_alg(body: &[u8]) -> u8 {
        if body.len() < FORMAT_DESCRIPTION_MIN_LENGTH + CHECKSUM_SIZE + 1 {
            return 0;
        }

        let version = server_version_string(&body[2..2 + SERVER_VERSION_LENGTH]);
        if !mysql_version_has_checksum(&version) {
            return 0;
        }

        body[body.len() - CHECKSUM_SIZE - 1]
    }

    /// 다음 완전한 이벤트 읽기. 파일 끝이면 None
    ///
    /// 잘린 이벤트는 `Growing`이면 아직 쓰는 중으로 보고 None, `Sealed`면 에러입니다.
    fn next_event<R: Read>(reader: &mut R, tail: TailMode) -> Result<Option<(EventHeader, Vec<u8>)>> {
        let mut header_buf = [0u8; EVENT_HEADER_SIZE];
        let n = read_full(reader, &mut header_buf)?;
        if n == 0 {
            return Ok(None);
        }
        if n < EVENT_HEADER_SIZE {
            if tail == TailMode::Sealed {
                return Err(CdcError::DecodeError(format!(
                    "Unexpected EOF in event header ({} of {} bytes)",
                    n, EVENT_HEADER_SIZE
                )));
            }
            debug!("Incomplete event header ({} bytes), waiting for more data", n);
            return Ok(None);
        }

        let header = Self::parse_header(&header_buf)?;
        if (header.event_length as usize) < EVENT_HEADER_SIZE || header.event_length > MAX_EVENT_LENGTH {
            return Err(CdcError::DecodeError(format!(
                "Invalid event length {} for type {}",
                header.event_length, header.type_code
            )));
        }

        let mut raw = vec![0u8; header.event_length as usize];
        raw[..EVENT_HEADER_SIZE].copy_from_slice(&header_buf);
        let body_len = raw.len() - EVENT_HEADER_SIZE;
        let n = read_full(reader, &mut raw[EVENT_HEADER_SIZE..])?;
        if n < body_len {
            if tail == TailMode::Sealed {
                return Err(CdcError::DecodeError(format!(
                    "Unexpected EOF in event body ({} of {} bytes)",
                    n, body_len
                )));
            }
            debug!(
                "Incomplete event body ({} of {} bytes), waiting for more data",
                n, body_len
            );
            return Ok(None);
        }

        Ok(Some((header, raw)))
    }

    fn decode_event(&self, header: EventHeader, raw: Vec<u8>, checksum: &mut bool) -> Result<BinlogEvent> {
        let mut checksum_alg = 0;
        if header.event_type == EventType::FormatDescriptionEvent {
            checksum_alg = Self::detect_checksum_alg(&raw[EVENT_HEADER_SIZE..]);
            *checksum = checksum_alg == CHECKSUM_ALG_CRC32;
        }

        let raw = Bytes::from(raw);
        let mut body_end = raw.len();
        if *checksum {
            if raw.len() < EVENT_HEADER_SIZE + CHECKSUM_SIZE {
                return Err(CdcError::DecodeError(format!(
                    "Event too short for checksum: {} bytes",
                    raw.len()
                )));
            }
            body_end -= CHECKSUM_SIZE;

            if self.config.verify_checksum {
                let expected = u32::from_le_bytes([
                    raw[body_end],
                    raw[body_end + 1],
                    raw[body_end + 2],
                    raw[body_end + 3],
                ]);
                let actual = crc32fast::hash(&raw[..body_end]);
                if expected != actual {
                    return Err(CdcError::DecodeError(format!(
                        "Checksum mismatch for type {}: expected {:#010x}, got {:#010x}",
                        header.type_code, expected, actual
                    )));
                }
            }
        }

        let payload = raw.slice(EVENT_HEADER_SIZE..body_end);
        let data = match header.event_type {
            EventType::RotateEvent => BinlogEventData::Rotate(Self::parse_rotate_event(&payload)?),
            EventType::FormatDescriptionEvent => BinlogEventData::FormatDescription(
                Self::parse_format_description(&payload, checksum_alg)?,
            ),
            _ => BinlogEventData::Opaque,
        };

        trace!(
            "Decoded {:?} event, {} bytes, next_pos={}",
            header.event_type,
            raw.len(),
            header.next_pos
        );

        Ok(BinlogEvent {
            header,
            data,
            payload,
            raw,
        })
    }
}

impl BinlogFileParser for BinlogParser {
    fn parse_file(
        &self,
        path: &Path,
        offset: u64,
        tail: TailMode,
        on_event: &mut OnEvent<'_>,
    ) -> Result<()> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);

        let mut magic = [0u8; 4];
        let n = read_full(&mut reader, &mut magic)?;
        if n < magic.len() {
            if tail == TailMode::Sealed {
                return Err(CdcError::FormatError(format!(
                    "{}: truncated magic header ({} bytes)",
                    path.display(),
                    n
                )));
            }
            // 방금 생성되어 아직 매직 헤더도 쓰이지 않은 파일
            debug!("{} has no magic header yet", path.display());
            return Ok(());
        }
        Self::verify_magic(&magic)
            .map_err(|e| CdcError::FormatError(format!("{}: {}", path.display(), e)))?;

        let mut checksum = false;
        let offset = offset.max(BINLOG_START_POSITION);
        if offset > BINLOG_START_POSITION {
            // 중간부터 읽을 때도 체크섬 방식은 첫 FORMAT_DESCRIPTION에서 알아냄 (전달하지 않음)
            let fde = Self::next_event(&mut reader, tail)
                .map_err(|e| with_location(e, path, BINLOG_START_POSITION))?;
            if let Some((header, raw)) = fde {
                if header.event_type == EventType::FormatDescriptionEvent {
                    self.decode_event(header, raw, &mut checksum)
                        .map_err(|e| with_location(e, path, BINLOG_START_POSITION))?;
                }
            }
            reader.seek(SeekFrom::Start(offset))?;
        }

        let mut pos = offset;
        loop {
            if self.stopped.load(Ordering::SeqCst) {
                debug!("Parsing {} stopped at {}", path.display(), pos);
                return Ok(());
            }

            let (header, raw) = match Self::next_event(&mut reader, tail)
                .map_err(|e| with_location(e, path, pos))?
            {
                Some(event) => event,
                None => break,
            };

            let event_length = u64::from(header.event_length);
            let event = self
                .decode_event(header, raw, &mut checksum)
                .map_err(|e| with_location(e, path, pos))?;
            pos += event_length;

            on_event(event)?;
        }

        Ok(())
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

/// 디코딩 에러에 파일 위치 정보 추가
fn with_location(err: CdcError, path: &Path, pos: u64) -> CdcError {
    match err {
        CdcError::DecodeError(msg) => {
            CdcError::DecodeError(format!("{}@{}: {}", path.display(), pos, msg))
        }
        other => other,
    }
}

/// EOF 전까지 버퍼를 채우고 읽은 바이트 수 반환
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn server_version_string(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).to_string()
}

/// 체크섬을 지원하는 서버 버전(5.6.1 이상)인지 확인
fn mysql_version_has_checksum(version: &str) -> bool {
    let numeric: String = version
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();

    let mut parts = numeric.split('.').map(|p| p.parse::<u32>().unwrap_or(0));
    let major = parts.next().unwrap_or(0);
    let minor = parts.next().unwrap_or(0);
    let patch = parts.next().unwrap_or(0);

    (major, minor, patch) >= (5, 6, 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::BinlogFileBuilder;
    use tempfile::TempDir;

    fn collect(parser: &BinlogParser, path: &Path, offset: u64) -> Result<Vec<BinlogEvent>> {
        let mut events = Vec::new();
        parser.parse_file(path, offset, TailMode::Growing, &mut |e| {
            events.push(e);
            Ok(())
        })?;
        Ok(events)
    }

    #[test]
    fn test_verify_magic() {
        let valid = vec![0xfe, 0x62, 0x69, 0x6e];
        assert!(BinlogParser::verify_magic(&valid).is_ok());

        let invalid = vec![0x00, 0x00, 0x00, 0x00];
        assert!(BinlogParser::verify_magic(&invalid).is_err());
    }

    #[test]
    fn test_version_has_checksum() {
        assert!(mysql_version_has_checksum("5.7.30-log"));
        assert!(mysql_version_has_checksum("5.6.1"));
        assert!(mysql_version_has_checksum("10.5.8-MariaDB"));
        assert!(!mysql_version_has_checksum("5.6.0"));
        assert!(!mysql_version_has_checksum("5.5.62-log"));
    }

    #[test]
    fn test_parse_file_from_start() {
        let dir = TempDir::new().unwrap();
        let mut builder = BinlogFileBuilder::new(7, true);
        let begin = builder.query("BEGIN");
        let xid = builder.xid(11);
        let end = builder.rotate("bin.000002", 4);
        let path = builder.write(dir.path(), "bin.000001");

        let events = collect(&BinlogParser::default(), &path, 4).unwrap();
        assert_eq!(events.len(), 4);

        let fde = &events[0];
        assert_eq!(fde.event_type(), EventType::FormatDescriptionEvent);
        match &fde.data {
            BinlogEventData::FormatDescription(data) => {
                assert_eq!(data.server_version, "5.7.30-log");
                assert_eq!(data.checksum_alg, 1);
                assert_eq!(data.binlog_version, 4);
            }
            other => panic!("unexpected data {:?}", other),
        }

        assert_eq!(events[1].header.next_pos as u64, begin);
        assert_eq!(&events[1].payload[..], b"BEGIN");
        assert_eq!(events[2].header.next_pos as u64, xid);
        assert_eq!(events[3].header.next_pos as u64, end);
        assert_eq!(events[3].header.server_id, 7);

        let rotate = events[3].rotate().unwrap();
        assert_eq!(rotate.next_binlog_name, "bin.000002");
        assert_eq!(rotate.position, 4);
    }

    #[test]
    fn test_resume_skips_format_description() {
        let dir = TempDir::new().unwrap();
        let mut builder = BinlogFileBuilder::new(7, true);
        let begin = builder.query("BEGIN");
        builder.query("COMMIT");
        let path = builder.write(dir.path(), "bin.000001");

        let events = collect(&BinlogParser::default(), &path, begin).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(&events[0].payload[..], b"COMMIT");
    }

    #[test]
    fn test_checksum_mismatch() {
        let dir = TempDir::new().unwrap();
        let mut builder = BinlogFileBuilder::new(7, true);
        builder.query("INSERT INTO t VALUES (1)");
        let mut bytes = builder.bytes().to_vec();
        let len = bytes.len();
        bytes[len - 6] ^= 0xff;
        let path = dir.path().join("bin.000001");
        std::fs::write(&path, &bytes).unwrap();

        let err = collect(&BinlogParser::default(), &path, 4).unwrap_err();
        assert!(matches!(err, CdcError::DecodeError(ref msg) if msg.contains("Checksum")));

        let lenient = BinlogParser::new(ParserConfig {
            verify_checksum: false,
        });
        let events = collect(&lenient, &path, 4).unwrap();
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn test_without_checksum() {
        let dir = TempDir::new().unwrap();
        let mut builder = BinlogFileBuilder::new(3, false);
        builder.query("BEGIN");
        let path = builder.write(dir.path(), "bin.000001");

        let events = collect(&BinlogParser::default(), &path, 4).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(&events[1].payload[..], b"BEGIN");
    }

    #[test]
    fn test_bad_magic() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bin.000001");
        std::fs::write(&path, b"nope and more").unwrap();

        let err = collect(&BinlogParser::default(), &path, 4).unwrap_err();
        assert!(matches!(err, CdcError::FormatError(_)));
    }

    #[test]
    fn test_truncated_tail_is_not_an_error() {
        let dir = TempDir::new().unwrap();
        let mut builder = BinlogFileBuilder::new(7, true);
        builder.query("BEGIN");
        builder.query("COMMIT");
        let bytes = builder.bytes();
        let path = dir.path().join("bin.000001");
        std::fs::write(&path, &bytes[..bytes.len() - 3]).unwrap();

        let events = collect(&BinlogParser::default(), &path, 4).unwrap();
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn test_truncated_sealed_file() {
        let dir = TempDir::new().unwrap();
        let mut builder = BinlogFileBuilder::new(7, true);
        builder.query("BEGIN");
        builder.query("LOST-EVENT");
        let bytes = builder.bytes();
        let parser = BinlogParser::default();

        // 본문이 잘린 경우
        let path = dir.path().join("bin.000001");
        std::fs::write(&path, &bytes[..bytes.len() - 3]).unwrap();
        let mut seen = Vec::new();
        let err = parser
            .parse_file(&path, 4, TailMode::Sealed, &mut |e| {
                seen.push(e);
                Ok(())
            })
            .unwrap_err();
        assert!(matches!(err, CdcError::DecodeError(ref msg) if msg.contains("EOF")), "{:?}", err);
        assert_eq!(seen.len(), 2);
        assert_eq!(&seen[1].payload[..], b"BEGIN");

        // 헤더가 잘린 경우
        let begin_end = seen[1].header.next_pos as usize;
        std::fs::write(&path, &bytes[..begin_end + 5]).unwrap();
        let err = parser
            .parse_file(&path, 4, TailMode::Sealed, &mut |_| Ok(()))
            .unwrap_err();
        assert!(matches!(err, CdcError::DecodeError(_)), "{:?}", err);

        // 매직 헤더도 다 쓰이지 않은 경우
        std::fs::write(&path, &bytes[..2]).unwrap();
        let err = parser
            .parse_file(&path, 4, TailMode::Sealed, &mut |_| Ok(()))
            .unwrap_err();
        assert!(matches!(err, CdcError::FormatError(_)), "{:?}", err);
        assert!(collect(&parser, &path, 4).unwrap().is_empty());
    }

    #[test]
    fn test_invalid_event_length() {
        let dir = TempDir::new().unwrap();
        let builder = BinlogFileBuilder::new(7, false);
        let mut bytes = builder.bytes().to_vec();
        // 길이 필드가 헤더보다 작은 이벤트
        bytes.extend_from_slice(&[0, 0, 0, 0, 2, 7, 0, 0, 0, 5, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
        let path = dir.path().join("bin.000001");
        std::fs::write(&path, &bytes).unwrap();

        let err = collect(&BinlogParser::default(), &path, 4).unwrap_err();
        assert!(matches!(err, CdcError::DecodeError(_)));
    }

    #[test]
    fn test_callback_error_propagates() {
        let dir = TempDir::new().unwrap();
        let mut builder = BinlogFileBuilder::new(7, true);
        builder.query("BEGIN");
        let path = builder.write(dir.path(), "bin.000001");

        let mut seen = 0;
        let err = BinlogParser::default()
            .parse_file(&path, 4, TailMode::Growing, &mut |_| {
                seen += 1;
                Err(CdcError::Canceled)
            })
            .unwrap_err();
        assert_eq!(err, CdcError::Canceled);
        assert_eq!(seen, 1);
    }

    #[test]
    fn test_stop() {
        let dir = TempDir::new().unwrap();
        let mut builder = BinlogFileBuilder::new(7, true);
        builder.query("BEGIN");
        builder.query("COMMIT");
        let path = builder.write(dir.path(), "bin.000001");

        let parser = BinlogParser::default();
        let mut seen = 0;
        parser
            .parse_file(&path, 4, TailMode::Growing, &mut |_| {
                seen += 1;
                parser.stop();
                Ok(())
            })
            .unwrap();
        assert_eq!(seen, 1);
    }

    #[test]
    fn test_missing_file() {
        let dir = TempDir::new().unwrap();
        let err = collect(&BinlogParser::default(), &dir.path().join("bin.000009"), 4).unwrap_err();
        assert!(matches!(err, CdcError::NotFound(_)));
    }
}
