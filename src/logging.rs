//! tracing初期化とホスト名プレフィックス付きフォーマッタ
//!
//! 複数ピアのログを1か所に集めたときにどのホストの行か判別できるよう、
//! 全行の先頭にホスト名を置く。色は付けない (ファイル集約前提)。

use std::fmt;
use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;

use crate::config::ServerConfig;

/// `[hostname] timestamp LEVEL span:span target file:line: message` 形式の
/// 1行フォーマッタ
pub struct HostnameFormatter {
    hostname: String,
}

impl HostnameFormatter {
    pub fn new() -> Self {
        let hostname = gethostname::gethostname()
            .to_str()
            .unwrap_or("unknown")
            .to_string();
        Self { hostname }
    }
}

impl Default for HostnameFormatter {
    fn default() -> Self {
        Self::new()
    }
}

impl<S, N> FormatEvent<S, N> for HostnameFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let meta = event.metadata();
        let datetime: chrono::DateTime<chrono::Utc> = std::time::SystemTime::now().into();

        write!(writer, "[{}] ", self.hostname)?;
        write!(writer, "{} ", datetime.format("%Y-%m-%dT%H:%M:%S%.6fZ"))?;
        write!(writer, "{:5} ", meta.level())?;

        // スパン階層は外側から順にコロン区切りで1行に収める
        if let Some(scope) = ctx.event_scope() {
            for span in scope.from_root() {
                write!(writer, "{}:", span.name())?;
            }
            write!(writer, " ")?;
        }

        write!(writer, "{}", meta.target())?;
        if let (Some(file), Some(line)) = (meta.file(), meta.line()) {
            write!(writer, ":{}:{}", file, line)?;
        }
        write!(writer, ": ")?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// グローバルサブスクライバを初期化する。既に初期化済みならfalseを返す
/// (同一プロセスに複数ピアを構築するテストは最初の1回だけ有効になる)。
pub fn try_init(level: &str) -> bool {
    use tracing_subscriber::fmt;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let fmt_layer = fmt::layer()
        .event_format(HostnameFormatter::new())
        .with_writer(std::io::stdout);

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .is_ok();
    if installed {
        tracing::info!("Logging initialized (level: {})", level);
    }
    installed
}

/// 設定のログレベルでtracingを初期化する (ピアブートストラップ用)。
pub fn init_from_config(config: &ServerConfig) -> bool {
    try_init(&config.node.log_level)
}
