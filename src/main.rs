/// 로컬 binlog 디렉토리 tailing 예제
///
/// 지정한 위치부터 이벤트를 읽어 한 줄에 하나씩 JSON으로 출력합니다. Ctrl-C로 종료합니다.
use binlog_streamer::{BinlogPosition, BinlogReader, BinlogReaderConfig, CdcError};
use std::env;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 로깅 초기화
    tracing_subscriber::fmt::init();

    let binlog_dir = env::var("BINLOG_DIR").unwrap_or_else(|_| "./binlog".to_string());
    let binlog_file = env::var("BINLOG_FILE").unwrap_or_else(|_| "mysql-bin.000001".to_string());
    let binlog_pos = env::var("BINLOG_POS")
        .unwrap_or_else(|_| "4".to_string())
        .parse()
        .unwrap_or(4);

    let config = BinlogReaderConfig::new(&binlog_dir);
    let reader = BinlogReader::new(config);

    let start = BinlogPosition::new(binlog_file, binlog_pos);
    info!("Reading binlog directory {} from {}", binlog_dir, start);

    let mut streamer = reader.start_sync(start)?;

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("got signal to exit");
        }
        signal_token.cancel();
    });

    let mut result = Ok(());
    loop {
        match streamer.get_event(&shutdown).await {
            Ok(event) => {
                let line = serde_json::json!({
                    "header": event.header,
                    "data": event.data,
                    "payload_len": event.payload.len(),
                });
                println!("{}", line);
            }
            Err(CdcError::Canceled) => break,
            Err(e) => {
                error!("binlog stream failed: {}", e);
                result = Err(e);
                break;
            }
        }
    }

    reader.close().await?;
    info!("binlog streamer exit");

    result.map_err(Into::into)
}
