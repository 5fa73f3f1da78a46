//! 自适应并发限制器模块
//!
//! 每个渠道一个限制器，限制同时在途的上游请求数。
//! - Fixed 模式：上限固定为渠道配置的 `max_concurrency`
//! - Adaptive 模式：根据滑动窗口内的错误率与平均响应时间动态调整上限
//!
//! 上限变化时重建信号量（软限制）：已经持有的许可不受影响，
//! 旧信号量在其许可全部释放后自然回收。

use super::log_codes::lim as log_lim;
use crate::config::ChannelConfig;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Instant;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// 进入调整逻辑前所需的最少样本数
const MIN_SAMPLES_FOR_ADJUSTMENT: usize = 10;

/// 限流模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitMode {
    /// 固定上限
    Fixed,
    /// 自适应上限
    Adaptive,
}

impl std::fmt::Display for LimitMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LimitMode::Fixed => write!(f, "fixed"),
            LimitMode::Adaptive => write!(f, "adaptive"),
        }
    }
}

/// 限制器配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// 固定并发上限；为 None 时进入自适应模式
    pub max_concurrency: Option<u32>,
    /// 自适应下限
    pub min_concurrency: u32,
    /// 自适应上限
    pub max_adaptive_concurrency: u32,
    /// 平均响应时间低于该值（秒）视为偏快
    pub response_time_low: f64,
    /// 平均响应时间高于该值（秒）视为偏慢
    pub response_time_high: f64,
    /// 错误率阈值 (0.0-1.0)
    pub error_rate_threshold: f64,
    /// 每次上调的步长
    pub increase_step: u32,
    /// 响应偏慢时的下调系数
    pub decrease_factor: f64,
    /// 统计窗口大小（请求数）
    pub stats_window_size: usize,
    /// 两次调整之间的冷却时间（秒）
    pub cooldown_seconds: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_concurrency: None,
            min_concurrency: 1,
            max_adaptive_concurrency: 100,
            response_time_low: 1.0,
            response_time_high: 5.0,
            error_rate_threshold: 0.1,
            increase_step: 2,
            decrease_factor: 0.8,
            stats_window_size: 100,
            cooldown_seconds: 5.0,
        }
    }
}

impl RateLimitConfig {
    /// 从渠道配置构建
    pub fn from_channel(channel: &ChannelConfig) -> Self {
        Self {
            max_concurrency: channel.max_concurrency.filter(|&m| m > 0),
            min_concurrency: channel.min_concurrency.max(1),
            max_adaptive_concurrency: channel
                .max_adaptive_concurrency
                .max(channel.min_concurrency.max(1)),
            response_time_low: channel.response_time_low,
            response_time_high: channel.response_time_high,
            error_rate_threshold: channel.error_rate_threshold,
            ..Self::default()
        }
    }

    /// 固定上限；`0` 与未设置等价
    fn fixed_limit(&self) -> Option<u32> {
        self.max_concurrency.filter(|&m| m > 0)
    }

    pub fn mode(&self) -> LimitMode {
        if self.fixed_limit().is_some() {
            LimitMode::Fixed
        } else {
            LimitMode::Adaptive
        }
    }

    /// 当前模式下的初始上限
    fn initial_limit(&self) -> u32 {
        match self.fixed_limit() {
            Some(max) => max,
            None => self.min_concurrency.max(1),
        }
    }
}

/// 单次请求记录
#[derive(Debug, Clone, Copy)]
pub struct RequestRecord {
    pub timestamp: Instant,
    /// 响应时间（秒）
    pub response_time: f64,
    pub is_error: bool,
    pub status_code: u16,
}

/// 渠道统计：定长滑动窗口，聚合值随淘汰同步扣减
#[derive(Debug, Clone)]
pub struct ChannelStats {
    records: VecDeque<RequestRecord>,
    capacity: usize,
    total_requests: u64,
    total_errors: u64,
    total_response_time: f64,
}

impl ChannelStats {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            records: VecDeque::with_capacity(capacity),
            capacity,
            total_requests: 0,
            total_errors: 0,
            total_response_time: 0.0,
        }
    }

    pub fn add_record(&mut self, record: RequestRecord) {
        while self.records.len() >= self.capacity {
            self.evict_oldest();
        }
        self.total_requests += 1;
        if record.is_error {
            self.total_errors += 1;
        }
        self.total_response_time += record.response_time;
        self.records.push_back(record);
    }

    fn evict_oldest(&mut self) {
        if let Some(old) = self.records.pop_front() {
            self.total_requests = self.total_requests.saturating_sub(1);
            if old.is_error {
                self.total_errors = self.total_errors.saturating_sub(1);
            }
            self.total_response_time = (self.total_response_time - old.response_time).max(0.0);
        }
    }

    /// 调整窗口大小，多余的旧记录会被淘汰
    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
        while self.records.len() > self.capacity {
            self.evict_oldest();
        }
    }

    pub fn avg_response_time(&self) -> f64 {
        if self.records.is_empty() {
            return 0.0;
        }
        self.total_response_time / self.records.len() as f64
    }

    pub fn error_rate(&self) -> f64 {
        if self.records.is_empty() {
            return 0.0;
        }
        self.total_errors as f64 / self.records.len() as f64
    }

    pub fn sample_count(&self) -> usize {
        self.records.len()
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests
    }

    pub fn total_errors(&self) -> u64 {
        self.total_errors
    }

    pub fn reset(&mut self) {
        self.records.clear();
        self.total_requests = 0;
        self.total_errors = 0;
        self.total_response_time = 0.0;
    }
}

/// 限制器统计快照
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterStats {
    pub channel_id: u32,
    pub channel_name: String,
    pub mode: LimitMode,
    pub current_limit: u32,
    pub avg_response_time: f64,
    pub error_rate: f64,
    pub sample_count: usize,
    pub total_requests: u64,
    pub total_errors: u64,
    pub in_flight: usize,
    pub available_permits: usize,
}

/// 供渠道选择使用的健康快照
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelHealth {
    pub error_rate: f64,
    pub avg_response_time: f64,
    pub sample_count: usize,
    pub in_flight: usize,
}

/// 并发许可
///
/// Drop 时自动归还槽位；也可以调用 [`LimiterPermit::release`] 显式归还。
#[derive(Debug)]
pub struct LimiterPermit {
    _permit: OwnedSemaphorePermit,
    in_flight: Arc<AtomicUsize>,
}

impl LimiterPermit {
    /// 显式归还槽位
    pub fn release(self) {}
}

impl Drop for LimiterPermit {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

struct LimiterState {
    config: RateLimitConfig,
    current_limit: u32,
    /// 上次调整时间，None 表示从未调整过
    last_adjustment: Option<Instant>,
    stats: ChannelStats,
}

/// 单渠道自适应限制器
pub struct AdaptiveLimiter {
    channel_id: u32,
    channel_name: RwLock<String>,
    state: Mutex<LimiterState>,
    /// 当前生效的信号量，上限变化时整体替换
    semaphore: RwLock<Arc<Semaphore>>,
    in_flight: Arc<AtomicUsize>,
}

impl AdaptiveLimiter {
    pub fn new(channel_id: u32, channel_name: impl Into<String>, config: RateLimitConfig) -> Self {
        let limit = config.initial_limit();
        let stats = ChannelStats::new(config.stats_window_size);
        Self {
            channel_id,
            channel_name: RwLock::new(channel_name.into()),
            state: Mutex::new(LimiterState {
                config,
                current_limit: limit,
                last_adjustment: None,
                stats,
            }),
            semaphore: RwLock::new(Arc::new(Semaphore::new(limit as usize))),
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn channel_id(&self) -> u32 {
        self.channel_id
    }

    pub fn channel_name(&self) -> String {
        self.channel_name
            .read()
            .map(|name| name.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }

    fn lock_state(&self) -> MutexGuard<'_, LimiterState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn current_semaphore(&self) -> Arc<Semaphore> {
        match self.semaphore.read() {
            Ok(sem) => sem.clone(),
            Err(e) => e.into_inner().clone(),
        }
    }

    fn replace_semaphore(&self, limit: u32) {
        let fresh = Arc::new(Semaphore::new(limit as usize));
        match self.semaphore.write() {
            Ok(mut sem) => *sem = fresh,
            Err(e) => *e.into_inner() = fresh,
        }
    }

    fn wrap(&self, permit: OwnedSemaphorePermit) -> LimiterPermit {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        LimiterPermit {
            _permit: permit,
            in_flight: self.in_flight.clone(),
        }
    }

    /// 非阻塞获取槽位，满载时返回 None
    pub fn try_acquire(&self) -> Option<LimiterPermit> {
        let sem = self.current_semaphore();
        sem.try_acquire_owned().ok().map(|permit| self.wrap(permit))
    }

    /// 等待直到获取槽位
    ///
    /// 等待的是调用时刻生效的信号量；上限在等待期间变化不会影响本次等待。
    pub async fn acquire(&self) -> LimiterPermit {
        loop {
            let sem = self.current_semaphore();
            match sem.acquire_owned().await {
                Ok(permit) => return self.wrap(permit),
                // 信号量从不关闭；若被关闭则取最新的信号量重试
                Err(_) => tokio::task::yield_now().await,
            }
        }
    }

    /// 记录一次请求结果，并在自适应模式下尝试调整上限
    ///
    /// `response_time` 单位为秒。
    pub fn record_request(&self, response_time: f64, is_error: bool, status_code: u16) {
        let new_limit = {
            let mut state = self.lock_state();
            state.stats.add_record(RequestRecord {
                timestamp: Instant::now(),
                response_time,
                is_error,
                status_code,
            });
            self.maybe_adjust(&mut state)
        };

        if let Some(limit) = new_limit {
            self.replace_semaphore(limit);
        }
    }

    /// 根据窗口统计计算新的上限；需要调整时返回新值
    fn maybe_adjust(&self, state: &mut LimiterState) -> Option<u32> {
        if state.config.mode() == LimitMode::Fixed {
            return None;
        }

        let now = Instant::now();
        if let Some(last) = state.last_adjustment {
            if now.duration_since(last).as_secs_f64() < state.config.cooldown_seconds {
                return None;
            }
        }

        if state.stats.sample_count() < MIN_SAMPLES_FOR_ADJUSTMENT {
            return None;
        }

        let config = &state.config;
        let current = state.current_limit;
        let error_rate = state.stats.error_rate();
        let avg = state.stats.avg_response_time();
        let min = config.min_concurrency.max(1);
        let max = config.max_adaptive_concurrency.max(min);

        let new_limit = if error_rate > config.error_rate_threshold {
            let next = min.max((current as f64 * 0.5) as u32);
            log::warn!(
                "[{}] 渠道 {} 错误率过高 ({:.2}%)，并发上限 {} → {}",
                log_lim::LIMIT_DECREASED_ERRORS,
                self.channel_id,
                error_rate * 100.0,
                current,
                next
            );
            next
        } else if avg > config.response_time_high {
            let next = min.max((current as f64 * config.decrease_factor) as u32);
            log::info!(
                "[{}] 渠道 {} 响应偏慢 ({:.2}s)，并发上限 {} → {}",
                log_lim::LIMIT_DECREASED_SLOW,
                self.channel_id,
                avg,
                current,
                next
            );
            next
        } else if avg < config.response_time_low
            && error_rate < config.error_rate_threshold * 0.5
        {
            let next = max.min(current.saturating_add(config.increase_step));
            log::debug!(
                "[{}] 渠道 {} 表现良好，并发上限 {} → {}",
                log_lim::LIMIT_INCREASED,
                self.channel_id,
                current,
                next
            );
            next
        } else {
            current
        };

        if new_limit == current {
            return None;
        }

        state.current_limit = new_limit;
        state.last_adjustment = Some(now);
        Some(new_limit)
    }

    /// 热更新配置
    ///
    /// - 切到 Fixed：上限改为 `max_concurrency`
    /// - 从 Fixed 切到 Adaptive：上限重置为 `min_concurrency`
    /// - Adaptive 内部更新：上限夹到新的 `[min, max]` 区间
    pub fn update_config(&self, config: RateLimitConfig) {
        let rebuilt = {
            let mut state = self.lock_state();
            if state.config == config {
                return;
            }

            let old_mode = state.config.mode();
            let new_mode = config.mode();
            let old_limit = state.current_limit;

            let new_limit = match (old_mode, new_mode) {
                (_, LimitMode::Fixed) => config.initial_limit(),
                (LimitMode::Fixed, LimitMode::Adaptive) => config.initial_limit(),
                (LimitMode::Adaptive, LimitMode::Adaptive) => {
                    let min = config.min_concurrency.max(1);
                    let max = config.max_adaptive_concurrency.max(min);
                    old_limit.clamp(min, max)
                }
            };

            if old_mode != new_mode {
                log::info!(
                    "[{}] 渠道 {} 限流模式 {} → {}",
                    log_lim::MODE_CHANGED,
                    self.channel_id,
                    old_mode,
                    new_mode
                );
            }

            state.stats.set_capacity(config.stats_window_size);
            state.config = config;
            state.current_limit = new_limit;

            (new_limit != old_limit || old_mode != new_mode).then_some(new_limit)
        };

        if let Some(limit) = rebuilt {
            self.replace_semaphore(limit);
        }
    }

    /// 更新渠道显示名
    pub fn set_channel_name(&self, name: &str) {
        match self.channel_name.write() {
            Ok(mut current) => *current = name.to_string(),
            Err(e) => *e.into_inner() = name.to_string(),
        }
    }

    pub fn config(&self) -> RateLimitConfig {
        self.lock_state().config.clone()
    }

    pub fn mode(&self) -> LimitMode {
        self.lock_state().config.mode()
    }

    pub fn current_limit(&self) -> u32 {
        self.lock_state().current_limit
    }

    /// 当前在途请求数
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// 当前信号量剩余槽位
    pub fn available_permits(&self) -> usize {
        self.current_semaphore().available_permits()
    }

    pub fn health(&self) -> ChannelHealth {
        let state = self.lock_state();
        ChannelHealth {
            error_rate: state.stats.error_rate(),
            avg_response_time: state.stats.avg_response_time(),
            sample_count: state.stats.sample_count(),
            in_flight: self.in_flight(),
        }
    }

    pub fn get_stats(&self) -> LimiterStats {
        let state = self.lock_state();
        LimiterStats {
            channel_id: self.channel_id,
            channel_name: self.channel_name(),
            mode: state.config.mode(),
            current_limit: state.current_limit,
            avg_response_time: round_to(state.stats.avg_response_time(), 3),
            error_rate: round_to(state.stats.error_rate(), 4),
            sample_count: state.stats.sample_count(),
            total_requests: state.stats.total_requests(),
            total_errors: state.stats.total_errors(),
            in_flight: self.in_flight(),
            available_permits: self.available_permits(),
        }
    }

    /// 清空统计窗口（不改变当前上限）
    pub fn reset_stats(&self) {
        self.lock_state().stats.reset();
        log::info!(
            "[{}] 渠道 {} 统计已重置",
            log_lim::STATS_RESET,
            self.channel_id
        );
    }
}

fn round_to(value: f64, digits: i32) -> f64 {
    let factor = 10f64.powi(digits);
    (value * factor).round() / factor
}

/// 全部渠道限制器的注册表
#[derive(Default)]
pub struct RateLimiterManager {
    limiters: RwLock<HashMap<u32, Arc<AdaptiveLimiter>>>,
}

impl RateLimiterManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// 获取或创建渠道的限制器；已存在时同步最新配置
    pub fn get_or_create(&self, channel: &ChannelConfig) -> Arc<AdaptiveLimiter> {
        let config = RateLimitConfig::from_channel(channel);

        if let Some(existing) = self.get(channel.id) {
            existing.update_config(config);
            existing.set_channel_name(&channel.name);
            return existing;
        }

        let mut limiters = match self.limiters.write() {
            Ok(guard) => guard,
            Err(e) => e.into_inner(),
        };
        limiters
            .entry(channel.id)
            .or_insert_with(|| Arc::new(AdaptiveLimiter::new(channel.id, &channel.name, config)))
            .clone()
    }

    pub fn get(&self, channel_id: u32) -> Option<Arc<AdaptiveLimiter>> {
        match self.limiters.read() {
            Ok(guard) => guard.get(&channel_id).cloned(),
            Err(e) => e.into_inner().get(&channel_id).cloned(),
        }
    }

    pub fn remove(&self, channel_id: u32) -> bool {
        match self.limiters.write() {
            Ok(mut guard) => guard.remove(&channel_id).is_some(),
            Err(e) => e.into_inner().remove(&channel_id).is_some(),
        }
    }

    /// 仅保留给定渠道的限制器（配置重载后清理已删除的渠道）
    pub fn retain(&self, channel_ids: &HashSet<u32>) {
        match self.limiters.write() {
            Ok(mut guard) => guard.retain(|id, _| channel_ids.contains(id)),
            Err(e) => e.into_inner().retain(|id, _| channel_ids.contains(id)),
        }
    }

    /// 记录某渠道的请求结果；渠道不存在时忽略
    pub fn record_request(&self, channel_id: u32, response_time: f64, is_error: bool, status: u16) {
        if let Some(limiter) = self.get(channel_id) {
            limiter.record_request(response_time, is_error, status);
        }
    }

    /// 所有限制器的统计，按渠道 ID 排序
    pub fn get_all_stats(&self) -> Vec<LimiterStats> {
        let limiters: Vec<Arc<AdaptiveLimiter>> = match self.limiters.read() {
            Ok(guard) => guard.values().cloned().collect(),
            Err(e) => e.into_inner().values().cloned().collect(),
        };
        let mut stats: Vec<LimiterStats> = limiters.iter().map(|l| l.get_stats()).collect();
        stats.sort_by_key(|s| s.channel_id);
        stats
    }

    pub fn reset_all_stats(&self) {
        let limiters: Vec<Arc<AdaptiveLimiter>> = match self.limiters.read() {
            Ok(guard) => guard.values().cloned().collect(),
            Err(e) => e.into_inner().values().cloned().collect(),
        };
        for limiter in limiters {
            limiter.reset_stats();
        }
    }

    pub fn len(&self) -> usize {
        match self.limiters.read() {
            Ok(guard) => guard.len(),
            Err(e) => e.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
