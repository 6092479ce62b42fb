//! Metric sources feeding the poller.
//!
//! A source answers an item key such as `vfs.dev.read[sda,sectors,avg1]`
//! with one typed value or a "not supported" reason.

pub mod diskstats;

use std::sync::Arc;

use crate::history::Value;
use diskstats::{DiskCollector, Direction, RateKind, RateWindow};

/// Produces values for item keys.
pub trait MetricSource: Send + Sync {
    fn collect(&self, key: &str, params: &[String]) -> Result<Value, String>;
}

/// Parsed item key: `name[param,param,...]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemKey {
    pub name: String,
    pub params: Vec<String>,
}

/// Parses an item key. Parameters may be double-quoted, in which case
/// commas and brackets inside are literal and `\"` escapes a quote.
pub fn parse_item_key(key: &str) -> Result<ItemKey, String> {
    let key = key.trim();
    let Some(open) = key.find('[') else {
        if key.is_empty() || key.contains(']') {
            return Err(format!("invalid item key \"{}\"", key));
        }
        return Ok(ItemKey {
            name: key.to_string(),
            params: Vec::new(),
        });
    };

    let name = &key[..open];
    if name.is_empty() || !key.ends_with(']') {
        return Err(format!("invalid item key \"{}\"", key));
    }
    let body = &key[open + 1..key.len() - 1];

    let mut params = Vec::new();
    let mut current = String::new();
    let mut chars = body.chars().peekable();
    let mut quoted = false;
    let mut was_quoted = false;

    while let Some(c) = chars.next() {
        match c {
            '"' if quoted => {
                quoted = false;
                was_quoted = true;
            }
            '"' if current.trim().is_empty() && !was_quoted => {
                current.clear();
                quoted = true;
            }
            '\\' if quoted && chars.peek() == Some(&'"') => {
                current.push('"');
                chars.next();
            }
            ',' if !quoted => {
                params.push(finish_param(&current, was_quoted));
                current.clear();
                was_quoted = false;
            }
            '[' | ']' if !quoted => {
                return Err(format!("unexpected '{}' in item key \"{}\"", c, key));
            }
            _ if was_quoted && !c.is_whitespace() => {
                return Err(format!("unexpected character after quoted parameter in \"{}\"", key));
            }
            _ => current.push(c),
        }
    }
    if quoted {
        return Err(format!("unterminated quoted parameter in \"{}\"", key));
    }
    params.push(finish_param(&current, was_quoted));

    Ok(ItemKey {
        name: name.to_string(),
        params,
    })
}

fn finish_param(raw: &str, quoted: bool) -> String {
    if quoted {
        raw.to_string()
    } else {
        raw.trim().to_string()
    }
}

/// Built-in source for the agent-style keys the proxy answers itself.
pub struct LocalMetricSource {
    disks: Arc<DiskCollector>,
}

impl LocalMetricSource {
    pub fn new(disks: Arc<DiskCollector>) -> Self {
        Self { disks }
    }

    fn disk_rate(&self, direction: Direction, params: &[String]) -> Result<Value, String> {
        if params.len() > 3 {
            return Err("Too many parameters.".to_string());
        }
        let device = params.first().map(String::as_str).unwrap_or("");
        if device.is_empty() || device == "all" {
            return Err("Device name is required.".to_string());
        }
        let kind = match params.get(1).map(String::as_str).unwrap_or("") {
            "" | "sps" | "sectors" => RateKind::Sectors,
            "ops" | "operations" => RateKind::Operations,
            "bps" | "bytes" => RateKind::Bytes,
            other => return Err(format!("Invalid second parameter \"{}\".", other)),
        };
        let window = match params.get(2).map(String::as_str).unwrap_or("") {
            "" | "avg1" => RateWindow::Avg1,
            "avg5" => RateWindow::Avg5,
            "avg15" => RateWindow::Avg15,
            other => return Err(format!("Invalid third parameter \"{}\".", other)),
        };
        let now = chrono::Utc::now().timestamp();
        Ok(Value::Float(self.disks.rate(device, direction, kind, window, now)))
    }
}

impl MetricSource for LocalMetricSource {
    fn collect(&self, key: &str, params: &[String]) -> Result<Value, String> {
        match key {
            "agent.ping" => Ok(Value::Uint(1)),
            "system.localtime" => match params.first().map(String::as_str).unwrap_or("") {
                "" | "utc" => Ok(Value::Uint(chrono::Utc::now().timestamp() as u64)),
                "local" => Ok(Value::Str(
                    chrono::Local::now()
                        .format("%Y-%m-%d,%H:%M:%S%.3f,%:z")
                        .to_string(),
                )),
                other => Err(format!("Invalid first parameter \"{}\".", other)),
            },
            "vfs.dev.read" => self.disk_rate(Direction::Read, params),
            "vfs.dev.write" => self.disk_rate(Direction::Write, params),
            _ => Err("Unsupported item key.".to_string()),
        }
    }
}
