//! 操作耗时与成功率统计
//!
//! 固定容量的环形缓冲区，满了以后淘汰最旧的记录。数据只在进程内，重启丢失。

use std::collections::{BTreeMap, VecDeque};
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::clock::Clock;

#[derive(Debug, Clone, Serialize)]
pub struct PerformanceMetric {
    pub operation: String,
    pub duration_ms: f64,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    pub recorded_at: DateTime<Utc>,
}

/// 单个操作的汇总，供健康检查输出
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct OperationSummary {
    pub operation: String,
    pub count: usize,
    pub average_ms: f64,
    pub success_rate: f64,
}

pub struct PerformanceMonitor {
    metrics: Mutex<VecDeque<PerformanceMetric>>,
    capacity: usize,
    slow_threshold: Duration,
    clock: Arc<dyn Clock>,
}

impl PerformanceMonitor {
    pub fn new(capacity: usize, slow_threshold: Duration, clock: Arc<dyn Clock>) -> Self {
        let capacity = capacity.max(1);
        Self {
            metrics: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            slow_threshold,
            clock,
        }
    }

    /// 执行并记录一次操作，结果原样返回
    pub async fn measure<T, E, Fut>(
        &self,
        operation: &str,
        metadata: Option<serde_json::Value>,
        work: Fut,
    ) -> Result<T, E>
    where
        E: Display,
        Fut: Future<Output = Result<T, E>>,
    {
        let started = Instant::now();
        let result = work.await;
        let elapsed = started.elapsed();

        if let Err(e) = &result {
            tracing::error!(
                operation,
                duration_ms = elapsed.as_millis() as u64,
                "Operation failed: {}",
                e
            );
        }
        self.record(operation, elapsed, result.is_ok(), metadata);
        result
    }

    pub fn record(
        &self,
        operation: &str,
        elapsed: Duration,
        success: bool,
        metadata: Option<serde_json::Value>,
    ) {
        if elapsed >= self.slow_threshold {
            tracing::warn!(
                operation,
                duration_ms = elapsed.as_millis() as u64,
                "Slow operation"
            );
        }

        let metric = PerformanceMetric {
            operation: operation.to_string(),
            duration_ms: elapsed.as_secs_f64() * 1000.0,
            success,
            metadata,
            recorded_at: self.clock.now(),
        };

        let mut metrics = self.metrics.lock();
        if metrics.len() == self.capacity {
            metrics.pop_front();
        }
        metrics.push_back(metric);
    }

    pub fn get_metrics(&self) -> Vec<PerformanceMetric> {
        self.metrics.lock().iter().cloned().collect()
    }

    pub fn average_duration(&self, operation: &str) -> Option<f64> {
        let metrics = self.metrics.lock();
        let durations: Vec<f64> = metrics
            .iter()
            .filter(|m| m.operation == operation)
            .map(|m| m.duration_ms)
            .collect();
        if durations.is_empty() {
            return None;
        }
        Some(durations.iter().sum::<f64>() / durations.len() as f64)
    }

    pub fn success_rate(&self, operation: &str) -> Option<f64> {
        let metrics = self.metrics.lock();
        let (total, ok) = metrics
            .iter()
            .filter(|m| m.operation == operation)
            .fold((0usize, 0usize), |(total, ok), m| {
                (total + 1, ok + usize::from(m.success))
            });
        (total > 0).then(|| ok as f64 / total as f64)
    }

    /// 按操作名汇总
    pub fn summary(&self) -> Vec<OperationSummary> {
        let metrics = self.metrics.lock();
        let mut grouped: BTreeMap<&str, (usize, usize, f64)> = BTreeMap::new();
        for m in metrics.iter() {
            let entry = grouped.entry(m.operation.as_str()).or_default();
            entry.0 += 1;
            entry.1 += usize::from(m.success);
            entry.2 += m.duration_ms;
        }

        grouped
            .into_iter()
            .map(|(operation, (count, ok, total_ms))| OperationSummary {
                operation: operation.to_string(),
                count,
                average_ms: total_ms / count as f64,
                success_rate: ok as f64 / count as f64,
            })
            .collect()
    }
}
