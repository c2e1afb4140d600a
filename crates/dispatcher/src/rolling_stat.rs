//! 固定容量的滚动统计
//!
//! 环形缓冲区保存最近的样本，`add` 覆盖最旧的样本并维护累计和，平均值为 O(1)。

use serde::{Deserialize, Serialize};

/// 最近 `capacity` 个正样本的滚动平均值
#[derive(Debug, Clone)]
pub struct RollingAverage {
    samples: Vec<f64>,
    capacity: usize,
    next: usize,
    total: f64,
    average: f64,
}

impl RollingAverage {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: Vec::with_capacity(capacity),
            capacity,
            next: 0,
            total: 0.0,
            average: 0.0,
        }
    }

    /// 非正样本会被忽略
    pub fn add(&mut self, x: f64) {
        if x <= 0.0 || !x.is_finite() {
            return;
        }
        if self.samples.len() < self.capacity {
            self.samples.push(x);
        } else {
            self.total -= self.samples[self.next];
            self.samples[self.next] = x;
        }
        self.total += x;
        self.next = (self.next + 1) % self.capacity;
        self.average = self.total / self.samples.len().max(1) as f64;
    }

    pub fn average(&self) -> f64 {
        self.average
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// 滚动平均值加上最小/最大值
///
/// 最小/最大值只与新样本比较，不会在旧样本移出窗口后重新计算，
/// 因此它们是全部历史样本的极值，而不是窗口内的极值。
#[derive(Debug, Clone)]
pub struct RollingMinMax {
    rolling: RollingAverage,
    min: f64,
    max: f64,
}

impl RollingMinMax {
    pub fn new(capacity: usize) -> Self {
        Self {
            rolling: RollingAverage::new(capacity),
            min: 0.0,
            max: 0.0,
        }
    }

    pub fn add(&mut self, x: f64) {
        if x <= 0.0 || !x.is_finite() {
            return;
        }
        if self.rolling.is_empty() {
            self.min = x;
            self.max = x;
        } else {
            self.min = self.min.min(x);
            self.max = self.max.max(x);
        }
        self.rolling.add(x);
    }

    pub fn average(&self) -> f64 {
        self.rolling.average()
    }

    pub fn min(&self) -> f64 {
        self.min
    }

    pub fn max(&self) -> f64 {
        self.max
    }

    pub fn len(&self) -> usize {
        self.rolling.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rolling.is_empty()
    }

    pub fn summary(&self) -> LatencySummary {
        LatencySummary {
            average: self.average(),
            min: self.min,
            max: self.max,
            samples: self.len(),
        }
    }
}

/// 延迟统计快照（秒）
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencySummary {
    pub average: f64,
    pub min: f64,
    pub max: f64,
    pub samples: usize,
}
