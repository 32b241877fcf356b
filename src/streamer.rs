//! 소비자용 이벤트 스트림
//!
//! 백그라운드 워커가 이벤트를 넣고 소비자는 `get_event`로 순서대로 꺼냅니다.
//! 워커가 에러로 종료되면 이미 큐에 들어간 이벤트를 모두 전달한 뒤 그 에러를 반환합니다.

use crate::error::{CdcError, Result};
use crate::events::BinlogEvent;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// 생산자와 소비자가 공유하는 종료 상태
#[derive(Debug, Default)]
struct StreamState {
    terminal: Mutex<Option<CdcError>>,
}

impl StreamState {
    fn terminal_error(&self) -> Option<CdcError> {
        self.terminal.lock().clone()
    }
}

/// 소비자 쪽 binlog 이벤트 스트림
#[derive(Debug)]
pub struct Streamer {
    rx: mpsc::Receiver<BinlogEvent>,
    state: Arc<StreamState>,
}

/// 워커 쪽 송신자
#[derive(Debug, Clone)]
pub(crate) struct StreamSender {
    tx: mpsc::Sender<BinlogEvent>,
    state: Arc<StreamState>,
    runtime: Handle,
}

/// `capacity`개까지 버퍼링하는 스트림 생성. 가득 차면 송신자가 기다림
pub(crate) fn channel(capacity: usize, runtime: Handle) -> (StreamSender, Streamer) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let state = Arc::new(StreamState::default());
    (
        StreamSender {
            tx,
            state: Arc::clone(&state),
            runtime,
        },
        Streamer { rx, state },
    )
}

impl Streamer {
    /// 다음 이벤트를 기다림
    ///
    /// `cancel`이 먼저 취소되면 `Canceled`. 큐가 비었고 워커가 에러로 종료했으면 그 에러를,
    /// 에러 없이 종료했으면(리더 종료) `ChannelClosed`를 반환합니다.
    pub async fn get_event(&mut self, cancel: &CancellationToken) -> Result<BinlogEvent> {
        tokio::select! {
            biased;
            event = self.rx.recv() => match event {
                Some(event) => Ok(event),
                None => Err(self.state.terminal_error().unwrap_or(CdcError::ChannelClosed)),
            },
            _ = cancel.cancelled() => Err(CdcError::Canceled),
        }
    }

    /// 최대 `timeout` 동안 다음 이벤트를 기다림
    pub async fn get_event_timeout(&mut self, timeout: Duration) -> Result<BinlogEvent> {
        match tokio::time::timeout(timeout, self.get_event(&CancellationToken::new())).await {
            Ok(result) => result,
            Err(_) => Err(CdcError::Timeout),
        }
    }

    /// 기록된 종료 에러 (있는 경우)
    pub fn terminal_error(&self) -> Option<CdcError> {
        self.state.terminal_error()
    }
}

impl StreamSender {
    /// 종료 에러 기록. 첫 번째 에러만 유지합니다.
    pub(crate) fn close_with_error(&self, err: CdcError) {
        let mut terminal = self.state.terminal.lock();
        if terminal.is_none() {
            *terminal = Some(err);
        }
    }

    fn is_closed(&self) -> bool {
        self.state.terminal.lock().is_some()
    }

    /// 블로킹 스레드에서 이벤트 전송
    ///
    /// 소비자가 느리면 기다리고, `cancel`이 취소되면 전달하지 않고 `Canceled`로 즉시 반환합니다.
    pub(crate) fn send_blocking(&self, event: BinlogEvent, cancel: &CancellationToken) -> Result<()> {
        if self.is_closed() {
            return Err(CdcError::ChannelClosed);
        }
        if cancel.is_cancelled() {
            return Err(CdcError::Canceled);
        }

        self.runtime.block_on(async {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(CdcError::Canceled),
                sent = self.tx.send(event) => sent.map_err(|_| CdcError::ChannelClosed),
            }
        })
    }
}
