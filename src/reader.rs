//! 로컬 binlog 디렉토리 리더
//!
//! 리더는 다음 순서로 동작합니다:
//! 1. 커서 파일부터 디렉토리의 binlog 파일 목록 수집
//! 2. 파일마다 시작 위치 결정, 필요하면 가짜 ROTATE 이벤트 전송 후 파싱
//! 3. 새 파일이 없으면 잠시 쉬었다가 다시 스캔 (tailing)
//!
//! 에러가 나면 스트림을 그 에러로 닫고 워커를 종료합니다.

use crate::binlog::{BinlogFileParser, BinlogParser, ParserConfig, TailMode};
use crate::binlog_file::{collect_binlog_files, ParsedFileName};
use crate::error::{CdcError, Result};
use crate::events::{fake_rotate_event, BinlogEvent, EventType};
use crate::offset::{BinlogPosition, BINLOG_START_POSITION};
use crate::streamer::{self, StreamSender, Streamer};
use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::{Cell, RefCell};
use std::cmp::Ordering;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::{Arc, Once};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

/// 리더 설정
#[derive(Debug, Clone)]
pub struct BinlogReaderConfig {
    /// binlog 파일이 있는 디렉토리
    pub binlog_dir: PathBuf,
    /// 새 파일이 없을 때 다시 스캔하기까지 대기 시간
    pub poll_interval: Duration,
    /// 소비자가 가져가지 않은 이벤트를 최대 몇 개까지 버퍼링할지
    pub event_buffer: usize,
    /// 디렉토리 목록 조회가 연속으로 몇 번 실패할 때까지 재시도할지
    pub listing_retries: u32,
    /// 디코딩 옵션
    pub parser: ParserConfig,
}

impl Default for BinlogReaderConfig {
    fn default() -> Self {
        BinlogReaderConfig {
            binlog_dir: PathBuf::new(),
            poll_interval: Duration::from_secs(1),
            event_buffer: 10240,
            listing_retries: 3,
            parser: ParserConfig::default(),
        }
    }
}

impl BinlogReaderConfig {
    pub fn new(binlog_dir: impl Into<PathBuf>) -> Self {
        BinlogReaderConfig {
            binlog_dir: binlog_dir.into(),
            ..Default::default()
        }
    }
}

/// 리더 생명주기 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderState {
    Idle,
    Running,
    Closed,
}

/// 로컬 binlog 파일 리더
pub struct BinlogReader {
    config: Arc<BinlogReaderConfig>,
    parser: Arc<dyn BinlogFileParser>,
    state: parking_lot::Mutex<ReaderState>,
    worker: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
    span: Span,
}

impl BinlogReader {
    /// 기본 파서로 리더 생성
    pub fn new(config: BinlogReaderConfig) -> Self {
        let parser = Arc::new(BinlogParser::new(config.parser.clone()));
        Self::with_parser(config, parser)
    }

    /// 다른 파일 파서를 사용하는 리더 생성
    pub fn with_parser(config: BinlogReaderConfig, parser: Arc<dyn BinlogFileParser>) -> Self {
        let span = info_span!("binlog_reader", dir = %config.binlog_dir.display());
        BinlogReader {
            config: Arc::new(config),
            parser,
            state: parking_lot::Mutex::new(ReaderState::Idle),
            worker: tokio::sync::Mutex::new(None),
            cancel: CancellationToken::new(),
            span,
        }
    }

    /// 로그를 기록할 span 지정
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn state(&self) -> ReaderState {
        *self.state.lock()
    }

    /// `pos`부터 동기화 시작
    ///
    /// 백그라운드 워커를 띄우고 바로 스트림을 반환합니다. 이후의 모든 에러는 스트림으로 전달됩니다.
    /// 워커는 호출한 tokio 런타임에서 실행되므로 런타임 밖에서 호출하면 `RuntimeUnavailable`입니다.
    pub fn start_sync(&self, pos: BinlogPosition) -> Result<Streamer> {
        if pos.filename.is_empty() {
            return Err(CdcError::InvalidArgument(
                "binlog file must be specified".to_string(),
            ));
        }

        let runtime = Handle::try_current()
            .map_err(|e| CdcError::RuntimeUnavailable(e.to_string()))?;

        let mut state = self.state.lock();
        match *state {
            ReaderState::Running => return Err(CdcError::AlreadyRunning),
            ReaderState::Closed => return Err(CdcError::Closed),
            ReaderState::Idle => {}
        }

        // close()는 state를 먼저 바꾸므로 여기서는 아직 아무도 worker를 잡고 있지 않음
        let mut worker = self
            .worker
            .try_lock()
            .map_err(|_| CdcError::AlreadyRunning)?;

        let (sender, streamer) = streamer::channel(self.config.event_buffer, runtime.clone());
        let ctx = WorkerContext {
            config: Arc::clone(&self.config),
            parser: Arc::clone(&self.parser),
            cancel: self.cancel.clone(),
            span: self.span.clone(),
        };

        info!(parent: &self.span, position = %pos, "Starting binlog sync");
        *worker = Some(runtime.spawn(run_worker(ctx, pos, sender).instrument(self.span.clone())));
        *state = ReaderState::Running;

        Ok(streamer)
    }

    /// 리더 종료. 워커가 완전히 끝날 때까지 기다리며 여러 번 호출해도 안전합니다.
    pub async fn close(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            if *state != ReaderState::Closed {
                info!(parent: &self.span, "binlog reader closing");
                *state = ReaderState::Closed;
            }
        }

        self.cancel.cancel();
        self.parser.stop();

        let mut worker = self.worker.lock().await;
        if let Some(handle) = worker.take() {
            if let Err(e) = handle.await {
                warn!(parent: &self.span, "binlog reader worker did not exit cleanly: {}", e);
            }
            info!(parent: &self.span, "binlog reader closed");
        }

        Ok(())
    }
}

impl Drop for BinlogReader {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.parser.stop();
    }
}

/// 워커가 사용하는 공유 컨텍스트 (불변, 패스마다 복제)
#[derive(Clone)]
struct WorkerContext {
    config: Arc<BinlogReaderConfig>,
    parser: Arc<dyn BinlogFileParser>,
    cancel: CancellationToken,
    span: Span,
}

/// 한 번의 스캔 결과
enum PassOutcome {
    /// 보이는 파일을 모두 읽음. 다음 스캔은 이 커서부터
    CaughtUp(BinlogPosition),
    Canceled,
    ListingFailed(CdcError),
    Failed(CdcError),
}

async fn run_worker(ctx: WorkerContext, mut cursor: BinlogPosition, sender: StreamSender) {
    let mut listing_failures = 0u32;

    loop {
        if ctx.cancel.is_cancelled() {
            break;
        }

        info!(position = %cursor, "Streaming binlog from position");

        let pass_ctx = ctx.clone();
        let pass_sender = sender.clone();
        let start = cursor.clone();
        let handle = tokio::task::spawn_blocking(move || {
            let span = pass_ctx.span.clone();
            span.in_scope(|| guarded_pass(&pass_ctx, start, &pass_sender))
        });

        let outcome = match handle.await {
            Ok(outcome) => outcome,
            Err(e) => PassOutcome::Failed(CdcError::FaultRecovered {
                message: format!("binlog pass task failed: {}", e),
                trace: String::new(),
            }),
        };

        match outcome {
            PassOutcome::CaughtUp(next) => {
                listing_failures = 0;
                cursor = next;
            }
            PassOutcome::Canceled => break,
            PassOutcome::ListingFailed(err)
                if err.is_transient() && listing_failures < ctx.config.listing_retries =>
            {
                listing_failures += 1;
                warn!(
                    "Listing binlog files failed ({}/{}), retrying: {}",
                    listing_failures, ctx.config.listing_retries, err
                );
            }
            PassOutcome::ListingFailed(err) | PassOutcome::Failed(err) => {
                if err == CdcError::ChannelClosed {
                    info!("Binlog stream dropped by consumer");
                } else {
                    error!("Binlog streaming error: {}", err);
                }
                sender.close_with_error(err);
                break;
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(ctx.config.poll_interval) => {}
            _ = ctx.cancel.cancelled() => break,
        }
    }

    debug!("Binlog streaming worker exits");
}

/// 패닉이 난 지점의 위치와 스택
struct PanicSite {
    location: String,
    trace: String,
}

thread_local! {
    static GUARDED: Cell<bool> = const { Cell::new(false) };
    static PANIC_SITE: RefCell<Option<PanicSite>> = const { RefCell::new(None) };
}

static PANIC_HOOK: Once = Once::new();

/// 보호 구간 안에서 난 패닉의 스택을 되감기 전에 기록하는 훅 설치 (기존 훅은 그대로 호출)
fn install_panic_hook() {
    PANIC_HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if GUARDED.with(Cell::get) {
                let site = PanicSite {
                    location: info
                        .location()
                        .map(|l| l.to_string())
                        .unwrap_or_else(|| "unknown location".to_string()),
                    trace: Backtrace::force_capture().to_string(),
                };
                PANIC_SITE.with(|slot| *slot.borrow_mut() = Some(site));
            }
            previous(info);
        }));
    });
}

/// 패스 중 발생한 패닉을 종료 에러로 변환
fn guarded_pass(ctx: &WorkerContext, start: BinlogPosition, sender: &StreamSender) -> PassOutcome {
    install_panic_hook();

    GUARDED.with(|g| g.set(true));
    let result = panic::catch_unwind(AssertUnwindSafe(|| run_pass(ctx, start, sender)));
    GUARDED.with(|g| g.set(false));
    let site = PANIC_SITE.with(|slot| slot.borrow_mut().take());

    match result {
        Ok(outcome) => outcome,
        Err(payload) => {
            let mut message = panic_message(payload.as_ref());
            let trace = match site {
                Some(site) => {
                    message = format!("{} at {}", message, site.location);
                    site.trace
                }
                None => Backtrace::force_capture().to_string(),
            };
            error!("Recovered from panic while parsing binlog: {}", message);
            PassOutcome::Failed(CdcError::FaultRecovered { message, trace })
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// 한 패스 동안 워커가 단독으로 소유하는 상태
struct PassState<'a> {
    cursor: BinlogPosition,
    server_id: Option<u32>,
    sender: &'a StreamSender,
    cancel: &'a CancellationToken,
}

impl PassState<'_> {
    fn on_event(&mut self, event: BinlogEvent) -> Result<()> {
        self.server_id = Some(event.header.server_id);
        self.update_position(&event);
        self.sender.send_blocking(event, self.cancel)
    }

    fn update_position(&mut self, event: &BinlogEvent) {
        if event.event_type() == EventType::RotateEvent {
            if let Some(rotate) = event.rotate() {
                if self.cursor.cmp_filename(&rotate.next_binlog_name) == Ordering::Less {
                    self.cursor = BinlogPosition::new(rotate.next_binlog_name.clone(), rotate.position);
                }
                info!(position = %self.cursor, "Rotate event");
            }
            return;
        }

        let log_pos = u64::from(event.header.next_pos);
        if self.cursor.position < log_pos {
            debug!(
                "Advance position {} -> {}",
                self.cursor.position, log_pos
            );
            self.cursor.position = log_pos;
        }
    }
}

fn run_pass(ctx: &WorkerContext, start: BinlogPosition, sender: &StreamSender) -> PassOutcome {
    let dir = &ctx.config.binlog_dir;

    let files = match collect_binlog_files(dir, &start.filename) {
        Ok(files) => files,
        Err(e) => return PassOutcome::ListingFailed(e),
    };
    let first_file = match ParsedFileName::parse(&start.filename) {
        Ok(parsed) => parsed,
        Err(e) => return PassOutcome::ListingFailed(e),
    };

    let mut state = PassState {
        cursor: start.clone(),
        server_id: None,
        sender,
        cancel: &ctx.cancel,
    };

    let last = files.len().saturating_sub(1);
    for (index, file) in files.into_iter().enumerate() {
        if ctx.cancel.is_cancelled() {
            return PassOutcome::Canceled;
        }

        let parsed = match ParsedFileName::parse(&file) {
            Ok(parsed) => parsed,
            Err(e) => return PassOutcome::Failed(e),
        };
        if !parsed.bigger_or_equal_than(&first_file) {
            debug!("Ignoring older binlog file {}", file);
            continue;
        }

        let offset = if parsed.equal(&first_file) {
            start.position
        } else {
            let offset = BINLOG_START_POSITION;
            match state.server_id {
                Some(server_id) => {
                    // 중간부터 읽기 시작하면 실제 ROTATE를 못 봤을 수 있으므로 파일마다 하나 만들어 보냄
                    let fake = match fake_rotate_event(&file, offset, server_id) {
                        Ok(event) => event,
                        Err(e) => return PassOutcome::Failed(e),
                    };
                    if let Err(e) = state.on_event(fake) {
                        return pass_error(e);
                    }
                }
                None => {
                    if state.cursor.cmp_filename(&file) == Ordering::Less {
                        state.cursor = BinlogPosition::new(file.clone(), offset);
                    }
                }
            }
            offset
        };

        // 뒤에 새 파일이 있으면 이 파일은 더 이상 자라지 않으므로 잘린 이벤트는 에러
        let tail = if index < last {
            TailMode::Sealed
        } else {
            TailMode::Growing
        };

        let path = dir.join(&file);
        info!("Parse file {} from offset {}", path.display(), offset);

        if let Err(e) = ctx
            .parser
            .parse_file(&path, offset, tail, &mut |event| state.on_event(event))
        {
            if e != CdcError::Canceled {
                error!(
                    "Parse binlog file {} from offset {} error: {}",
                    path.display(),
                    offset,
                    e
                );
            }
            return pass_error(e);
        }
    }

    PassOutcome::CaughtUp(state.cursor)
}

fn pass_error(err: CdcError) -> PassOutcome {
    match err {
        CdcError::Canceled => PassOutcome::Canceled,
        other => PassOutcome::Failed(other),
    }
}
