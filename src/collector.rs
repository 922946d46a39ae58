//! Self-metrics collector.
//!
//! Every `metric-interval` the collector samples the counters of all live
//! components through the [`App`] and publishes them under `metric-prefix`,
//! either into the local write channel or to a remote Graphite endpoint.
//!
//! The collector only holds a [`Weak`] reference to the app, and every sample
//! is raced against cancellation, so stopping it never waits on the app lock.

use std::fmt;
use std::sync::{Mutex, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UdpSocket};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::app::App;
use crate::config::{ConfigError, METRIC_ENDPOINT_LOCAL};
use crate::row::{Point, WriteBuffer};
use crate::writer::WriteSender;

/// Where self-metrics go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// The local write channel.
    Local,
    /// Plaintext over TCP to `host:port`.
    Tcp(String),
    /// Plaintext over UDP to `host:port`.
    Udp(String),
}

impl Endpoint {
    /// Parse a normalized `common.metric-endpoint` value.
    pub fn parse(endpoint: &str) -> Result<Self, ConfigError> {
        if endpoint.is_empty() || endpoint == METRIC_ENDPOINT_LOCAL {
            return Ok(Self::Local);
        }

        let url = url::Url::parse(endpoint).map_err(|source| ConfigError::EndpointParse {
            endpoint: endpoint.to_string(),
            source,
        })?;
        let (Some(host), Some(port)) = (url.host_str(), url.port()) else {
            return Err(ConfigError::ValidationError(format!(
                "common.metric-endpoint {endpoint:?} must include host and port"
            )));
        };
        let addr = format!("{host}:{port}");

        match url.scheme() {
            "tcp" => Ok(Self::Tcp(addr)),
            "udp" => Ok(Self::Udp(addr)),
            scheme => Err(ConfigError::UnsupportedEndpointScheme {
                endpoint: endpoint.to_string(),
                scheme: scheme.to_string(),
            }),
        }
    }
}

/// Collector settings taken from `common`.
#[derive(Debug, Clone)]
pub struct CollectorOptions {
    pub prefix: String,
    pub endpoint: Endpoint,
    pub interval: Duration,
}

/// Running collector handle.
pub struct Collector {
    endpoint: Endpoint,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for Collector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collector")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl Collector {
    /// Spawn the sampling task. The first sample is taken one interval from now.
    pub fn new(app: Weak<App>, options: CollectorOptions, write_tx: WriteSender) -> Self {
        let cancel = CancellationToken::new();
        let endpoint = options.endpoint.clone();
        let task = SamplingTask {
            app,
            options,
            write_tx,
            cancel: cancel.clone(),
        };

        Self {
            endpoint,
            cancel,
            task: Mutex::new(Some(tokio::spawn(task.run()))),
        }
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Cancel sampling and wait for the task. An in-flight sample is abandoned.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            tracing::warn!(error = %e, "Collector task ended abnormally");
        }
    }
}

struct SamplingTask {
    app: Weak<App>,
    options: CollectorOptions,
    write_tx: WriteSender,
    cancel: CancellationToken,
}

impl SamplingTask {
    async fn run(self) {
        let interval = self.options.interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            prefix = %self.options.prefix,
            endpoint = ?self.options.endpoint,
            interval = %humantime::format_duration(interval),
            "Collector started"
        );

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                keep_going = self.sample() => {
                    if !keep_going {
                        break;
                    }
                }
            }
        }

        tracing::debug!("Collector stopped");
    }

    /// Take and publish one sample. Returns `false` once the app is gone.
    async fn sample(&self) -> bool {
        let Some(app) = self.app.upgrade() else {
            return false;
        };

        let mut metrics = Vec::new();
        app.stats(&mut |name: &str, value: f64| {
            metrics.push((format!("{}.{}", self.options.prefix, name), value));
        })
        .await;
        drop(app);

        let now = unix_now();
        if let Err(e) = self.publish(&metrics, now).await {
            tracing::warn!(endpoint = ?self.options.endpoint, error = %e, "Failed to publish self-metrics");
        }
        true
    }

    async fn publish(&self, metrics: &[(String, f64)], now: u32) -> std::io::Result<()> {
        match &self.options.endpoint {
            Endpoint::Local => {
                let mut buf = WriteBuffer::new();
                for (name, value) in metrics {
                    buf.write_point(&Point::new(name.as_str(), *value, now), now);
                }
                if !buf.is_empty() && self.write_tx.send(buf).await.is_err() {
                    tracing::debug!("Write channel closed, self-metrics dropped");
                }
            }
            Endpoint::Tcp(addr) => {
                let mut stream = TcpStream::connect(addr).await?;
                stream.write_all(&plaintext(metrics, now)).await?;
                stream.shutdown().await?;
            }
            Endpoint::Udp(addr) => {
                let socket = UdpSocket::bind("0.0.0.0:0").await?;
                socket.send_to(&plaintext(metrics, now), addr).await?;
            }
        }
        Ok(())
    }
}

fn unix_now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or_default()
}

/// Render metrics as Graphite plaintext lines.
fn plaintext(metrics: &[(String, f64)], now: u32) -> Vec<u8> {
    let mut out = String::new();
    for (name, value) in metrics {
        out.push_str(&format!("{name} {value} {now}\n"));
    }
    out.into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_parse() {
        assert_eq!(Endpoint::parse("local").unwrap(), Endpoint::Local);
        assert_eq!(Endpoint::parse("").unwrap(), Endpoint::Local);
        assert_eq!(
            Endpoint::parse("tcp://graphite:2003").unwrap(),
            Endpoint::Tcp("graphite:2003".to_string())
        );
        assert_eq!(
            Endpoint::parse("udp://127.0.0.1:2003").unwrap(),
            Endpoint::Udp("127.0.0.1:2003".to_string())
        );
        assert!(matches!(
            Endpoint::parse("tcp://graphite"),
            Err(ConfigError::ValidationError(_))
        ));
        assert!(matches!(
            Endpoint::parse("http://graphite:80"),
            Err(ConfigError::UnsupportedEndpointScheme { .. })
        ));
    }

    #[test]
    fn test_plaintext() {
        let metrics = vec![
            ("p.writer.files".to_string(), 3.0),
            ("p.tcp.errors".to_string(), 0.5),
        ];
        assert_eq!(
            plaintext(&metrics, 100),
            b"p.writer.files 3 100\np.tcp.errors 0.5 100\n".to_vec()
        );
    }

    #[tokio::test]
    async fn test_stop_without_app() {
        let (tx, _rx) = crate::writer::write_channel();
        let collector = Collector::new(
            Weak::new(),
            CollectorOptions {
                prefix: "p".to_string(),
                endpoint: Endpoint::Local,
                interval: Duration::from_millis(10),
            },
            tx,
        );
        // The first sample finds no app and the task ends on its own.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!collector.is_running());
        collector.stop().await;
        collector.stop().await;
    }
}
