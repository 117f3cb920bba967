//! シリアル接続のGPSデバイスとのやり取り
//!
//! デバイスに `GET_GPS` を送ると `lat,lon,<未使用>,<ISO-8601時刻>Z` の1行が返る。
//! 問い合わせは最短でも3秒おきで、解析できない応答は無視して直前の位置を使い続ける。
//! 読み込みは2秒でタイムアウトし、応答のないデバイスで処理が止まらない。

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use serialport::SerialPort;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::Path;
use std::time::{Duration, Instant};

/// デバイスへの問い合わせコマンド
pub const GPS_COMMAND: &[u8] = b"GET_GPS";

/// 問い合わせ間隔
pub const POLL_INTERVAL: Duration = Duration::from_secs(3);

/// 応答待ちの上限
pub const READ_TIMEOUT: Duration = Duration::from_secs(2);

pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// 実機のシリアルポート
pub type SerialTransport = Box<dyn SerialPort>;

/// これ以下のバイト数の応答は空とみなす
const MIN_RESPONSE_LEN: usize = 2;

const TIME_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

/// 測位結果
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GpsFix {
    pub latitude: f64,
    pub longitude: f64,
    /// UTC
    pub time: NaiveDateTime,
}

impl GpsFix {
    /// 応答1行を解析
    pub fn parse(response: &str) -> Result<Self> {
        let fields: Vec<&str> = response.trim().split(',').map(str::trim).collect();
        if fields.len() < 4 {
            anyhow::bail!("expected at least 4 fields, got {}: {:?}", fields.len(), response.trim());
        }

        let latitude: f64 = fields[0]
            .parse()
            .with_context(|| format!("Invalid latitude: {:?}", fields[0]))?;
        let longitude: f64 = fields[1]
            .parse()
            .with_context(|| format!("Invalid longitude: {:?}", fields[1]))?;
        if !(-90.0..=90.0).contains(&latitude) || !(-180.0..=180.0).contains(&longitude) {
            anyhow::bail!("coordinates out of range: {}, {}", latitude, longitude);
        }

        let stamp = fields[3].strip_suffix('Z').unwrap_or(fields[3]);
        let time = TIME_FORMATS
            .iter()
            .find_map(|format| NaiveDateTime::parse_from_str(stamp, format).ok())
            .ok_or_else(|| anyhow::anyhow!("Invalid timestamp: {:?}", fields[3]))?;

        Ok(Self {
            latitude,
            longitude,
            time,
        })
    }

    pub fn time_string(&self) -> String {
        self.time.format("%Y-%m-%dT%H:%M:%SZ").to_string()
    }
}

/// GPSデバイスとの接続
///
/// ドロップ時に下層のトランスポートも閉じられる。
pub struct GpsLink<T: Read + Write> {
    reader: BufReader<T>,
}

impl<T: Read + Write> GpsLink<T> {
    pub fn new(transport: T) -> Self {
        Self {
            reader: BufReader::new(transport),
        }
    }

    /// コマンドを送って1行読む（改行を含む生の応答）
    pub fn query(&mut self) -> Result<String> {
        let port = self.reader.get_mut();
        port.write_all(GPS_COMMAND).context("Failed to send GPS command")?;
        port.flush()?;

        let mut line = String::new();
        self.reader
            .read_line(&mut line)
            .context("Failed to read GPS response")?;
        Ok(line)
    }

    pub fn into_inner(self) -> T {
        self.reader.into_inner()
    }
}

impl GpsLink<SerialTransport> {
    /// シリアルデバイス（例: /dev/ttyUSB0）を開く
    pub fn open(path: &Path, baud_rate: u32) -> Result<Self> {
        let port = serialport::new(path.to_string_lossy(), baud_rate)
            .timeout(READ_TIMEOUT)
            .open()
            .with_context(|| format!("Failed to open GPS device: {}", path.display()))?;
        tracing::info!("GPSデバイスを開きました: {} ({} baud)", path.display(), baud_rate);
        Ok(Self::new(port))
    }
}

/// 問い合わせ間隔の管理と最後の測位結果の保持
#[derive(Debug, Clone)]
pub struct GpsTracker {
    interval: Duration,
    last_poll: Option<Instant>,
    last_fix: Option<GpsFix>,
}

impl Default for GpsTracker {
    fn default() -> Self {
        Self::new(POLL_INTERVAL)
    }
}

impl GpsTracker {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_poll: None,
            last_fix: None,
        }
    }

    pub fn last_fix(&self) -> Option<GpsFix> {
        self.last_fix
    }

    /// 初回は即座に、それ以降は前回から interval を超えたら問い合わせる
    pub fn is_due(&self, now: Instant) -> bool {
        match self.last_poll {
            None => true,
            Some(prev) => now.saturating_duration_since(prev) > self.interval,
        }
    }

    /// 応答を反映する。空・不正な応答では直前の位置を保持
    pub fn handle_response(&mut self, response: &str) -> Option<GpsFix> {
        if response.len() <= MIN_RESPONSE_LEN {
            tracing::debug!("GPS応答が空です");
            return self.last_fix;
        }

        match GpsFix::parse(response) {
            Ok(fix) => {
                tracing::debug!(
                    "GPS: lat={:.6}, lon={:.6}, time={}",
                    fix.latitude,
                    fix.longitude,
                    fix.time_string()
                );
                self.last_fix = Some(fix);
            }
            Err(e) => {
                tracing::warn!("GPS応答を解析できません（直前の位置を使用）: {:#}", e);
            }
        }
        self.last_fix
    }

    /// 必要なら問い合わせを行い、現在の測位結果を返す
    pub fn poll<T: Read + Write>(&mut self, link: &mut GpsLink<T>, now: Instant) -> Option<GpsFix> {
        if !self.is_due(now) {
            return self.last_fix;
        }
        self.last_poll = Some(now);

        match link.query() {
            Ok(response) => self.handle_response(&response),
            Err(e) => {
                tracing::warn!("GPS問い合わせに失敗しました: {:#}", e);
                self.last_fix
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Cursor;

    /// 書き込みを記録し、用意した応答を返すシリアルポートの代わり
    pub(crate) struct MockSerial {
        input: Cursor<Vec<u8>>,
        pub written: Vec<u8>,
    }

    impl MockSerial {
        pub(crate) fn with_responses(responses: &str) -> Self {
            Self {
                input: Cursor::new(responses.as_bytes().to_vec()),
                written: Vec::new(),
            }
        }
    }

    impl Read for MockSerial {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for MockSerial {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.written.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    /// 何も返さず、読み込みがタイムアウトするデバイス
    struct SilentSerial {
        written: Vec<u8>,
    }

    impl Read for SilentSerial {
        fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
            Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "Operation timed out"))
        }
    }

    impl Write for SilentSerial {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.written.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_silent_device_times_out_and_keeps_fix() {
        let mut link = GpsLink::new(SilentSerial { written: Vec::new() });
        assert!(link.query().is_err());

        let mut tracker = GpsTracker::default();
        let fix = tracker.handle_response("1.0,2.0,0,2025-05-04T13:01:57Z\n");
        let start = Instant::now();
        assert_eq!(tracker.poll(&mut link, start), fix);
        assert_eq!(tracker.poll(&mut link, start + Duration::from_secs(4)), fix);

        // 問い合わせ自体は毎回送っている
        assert_eq!(link.into_inner().written, b"GET_GPSGET_GPSGET_GPS".to_vec());
    }

    #[test]
    fn test_open_missing_device_is_error() {
        assert!(GpsLink::open(Path::new("/nonexistent/ttyGPS"), DEFAULT_BAUD_RATE).is_err());
    }

    #[test]
    fn test_parse_well_formed() {
        let fix = GpsFix::parse("53.308990,-6.223740,12.5,2025-05-04T13:01:57Z\r\n").unwrap();
        assert_eq!(fix.latitude, 53.30899);
        assert_eq!(fix.longitude, -6.22374);
        assert_eq!(fix.time_string(), "2025-05-04T13:01:57Z");
    }

    #[test]
    fn test_parse_fractional_seconds_without_z() {
        let fix = GpsFix::parse("1.5,2.5,x,2025-05-04T13:01:57.250").unwrap();
        assert_eq!(fix.time.and_utc().timestamp_subsec_millis(), 250);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(GpsFix::parse("53.3,-6.2,0").is_err());
        assert!(GpsFix::parse("north,-6.2,0,2025-05-04T13:01:57Z").is_err());
        assert!(GpsFix::parse("53.3,-6.2,0,yesterday").is_err());
        assert!(GpsFix::parse("153.3,-6.2,0,2025-05-04T13:01:57Z").is_err());
    }

    #[test]
    fn test_tracker_keeps_last_fix() {
        let mut tracker = GpsTracker::default();
        let good = tracker.handle_response("10.0,20.0,0,2025-05-04T13:01:57Z\n");
        assert_eq!(good.map(|f| f.latitude), Some(10.0));

        assert_eq!(tracker.handle_response("garbage,line\n"), good);
        assert_eq!(tracker.handle_response("\r\n"), good);
        assert_eq!(tracker.last_fix(), good);
    }

    #[test]
    fn test_tracker_rate_limit() {
        let mut link = GpsLink::new(MockSerial::with_responses(
            "10.0,20.0,0,2025-05-04T13:01:57Z\n11.0,21.0,0,2025-05-04T13:02:01Z\n",
        ));
        let mut tracker = GpsTracker::default();
        let start = Instant::now();

        assert_eq!(tracker.poll(&mut link, start).map(|f| f.latitude), Some(10.0));
        // 3秒以内は問い合わせない
        assert_eq!(
            tracker.poll(&mut link, start + Duration::from_secs(2)).map(|f| f.latitude),
            Some(10.0)
        );
        assert_eq!(
            tracker.poll(&mut link, start + Duration::from_secs(3)).map(|f| f.latitude),
            Some(10.0)
        );
        assert_eq!(
            tracker.poll(&mut link, start + Duration::from_millis(3100)).map(|f| f.latitude),
            Some(11.0)
        );

        assert_eq!(link.into_inner().written, b"GET_GPSGET_GPS".to_vec());
    }

    #[test]
    fn test_query_failure_keeps_fix() {
        let mut link = GpsLink::new(MockSerial::with_responses(""));
        let mut tracker = GpsTracker::default();
        tracker.handle_response("1.0,2.0,0,2025-05-04T13:01:57Z\n");
        // 応答なし（0バイト）は空扱い
        assert_eq!(tracker.poll(&mut link, Instant::now()).map(|f| f.longitude), Some(2.0));
    }
}
