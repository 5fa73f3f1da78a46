//! 渠道路由器模块
//!
//! 负责解析候选渠道、按健康度排序，并在选择锁内轮询获取并发槽位。

use crate::config::{ChannelConfig, TokenConfig};
use crate::proxy::error::ProxyError;
use crate::proxy::limiter::{AdaptiveLimiter, ChannelHealth, LimiterPermit, RateLimiterManager};
use crate::proxy::log_codes::sel as log_sel;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// 判定不健康所需的最少样本数
const UNHEALTHY_MIN_SAMPLES: usize = 5;
/// 错误率超过该值视为不健康
const UNHEALTHY_ERROR_RATE: f64 = 0.5;
/// 平均响应时间超过该值（秒）视为不健康
const UNHEALTHY_AVG_RESPONSE_SECS: f64 = 30.0;

/// 候选渠道及实际发送的模型名
#[derive(Debug, Clone)]
pub struct Candidate {
    pub channel: Arc<ChannelConfig>,
    pub model: String,
}

/// 选中的渠道，持有其并发槽位
pub struct Selected {
    pub channel: Arc<ChannelConfig>,
    pub model: String,
    pub limiter: Arc<AdaptiveLimiter>,
    pub permit: LimiterPermit,
}

impl ChannelHealth {
    pub fn is_unhealthy(&self) -> bool {
        self.sample_count >= UNHEALTHY_MIN_SAMPLES
            && (self.error_rate > UNHEALTHY_ERROR_RATE
                || self.avg_response_time > UNHEALTHY_AVG_RESPONSE_SECS)
    }
}

/// 解析候选渠道
///
/// `channels` 为已启用且按优先级排序的渠道。
/// - 高可用模式：所有渠道都是候选，模型替换为渠道的首个模型（无模型列表时沿用请求模型）；
///   令牌的模型白名单按替换后的模型过滤渠道
/// - 普通模式：按渠道模型列表匹配（大小写不敏感），令牌不允许请求模型时返回 403
pub fn resolve_candidates(
    channels: &[Arc<ChannelConfig>],
    model: &str,
    token: Option<&TokenConfig>,
    high_availability: bool,
) -> Result<Vec<Candidate>, ProxyError> {
    if !high_availability {
        if let Some(token) = token {
            if !model.is_empty() && !token.allows_model(model) {
                return Err(ProxyError::Forbidden(format!(
                    "令牌 {} 无权使用模型 '{model}'",
                    token.name
                )));
            }
        }
    }

    let candidates: Vec<Candidate> = channels
        .iter()
        .filter(|c| token.is_none_or(|t| t.allows_channel(c.id)))
        .filter_map(|channel| {
            if high_availability {
                let substituted = channel.substitute_model().unwrap_or(model).to_string();
                let allowed = token.is_none_or(|t| t.allows_model(&substituted));
                allowed.then(|| Candidate {
                    channel: channel.clone(),
                    model: substituted,
                })
            } else {
                channel.supports_model(model).then(|| Candidate {
                    channel: channel.clone(),
                    model: model.to_string(),
                })
            }
        })
        .collect();

    if candidates.is_empty() {
        log::warn!(
            "[{}] 没有可承接模型 '{}' 的渠道",
            log_sel::NO_CANDIDATES,
            model
        );
        return Err(ProxyError::NoAvailableChannel(format!(
            "没有可用于模型 '{model}' 的渠道"
        )));
    }
    Ok(candidates)
}

/// 渠道路由器
pub struct ChannelRouter {
    limiters: Arc<RateLimiterManager>,
    /// 全局轮询游标
    cursor: AtomicUsize,
    /// 选择锁：保证并发请求不会同时看到同一个空闲槽位
    select_lock: Mutex<()>,
    /// 全部渠道满载时阻塞等待槽位的上限
    acquire_timeout: Duration,
}

impl ChannelRouter {
    pub fn new(limiters: Arc<RateLimiterManager>, acquire_timeout: Duration) -> Self {
        Self {
            limiters,
            cursor: AtomicUsize::new(0),
            select_lock: Mutex::new(()),
            acquire_timeout,
        }
    }

    pub fn limiters(&self) -> &Arc<RateLimiterManager> {
        &self.limiters
    }

    /// 按健康度排序：不健康的靠后，其次按优先级、在途请求数升序
    fn order_by_health(
        &self,
        candidates: &[Candidate],
        excluded: &HashSet<u32>,
    ) -> Vec<(Candidate, Arc<AdaptiveLimiter>)> {
        let mut ordered: Vec<(Candidate, Arc<AdaptiveLimiter>, bool, usize)> = candidates
            .iter()
            .filter(|c| !excluded.contains(&c.channel.id))
            .map(|c| {
                let limiter = self.limiters.get_or_create(&c.channel);
                let health = limiter.health();
                let unhealthy = health.is_unhealthy();
                if unhealthy {
                    log::debug!(
                        "[{}] 渠道 {} 不健康 (错误率 {:.2}, 平均耗时 {:.2}s)",
                        log_sel::UNHEALTHY,
                        c.channel.name,
                        health.error_rate,
                        health.avg_response_time
                    );
                }
                (c.clone(), limiter, unhealthy, health.in_flight)
            })
            .collect();

        ordered.sort_by_key(|(c, _, unhealthy, in_flight)| {
            (*unhealthy, c.channel.priority, *in_flight)
        });
        ordered
            .into_iter()
            .map(|(c, limiter, _, _)| (c, limiter))
            .collect()
    }

    /// 选择一个渠道并占用其槽位
    ///
    /// 从轮询游标开始找第一个能立即获得槽位的渠道；全部满载时，
    /// 释放选择锁后在游标所指渠道上阻塞等待（有超时）。
    pub async fn select(
        &self,
        candidates: &[Candidate],
        excluded: &HashSet<u32>,
    ) -> Result<Selected, ProxyError> {
        let (candidate, limiter) = {
            let _guard = self.select_lock.lock().await;

            let ordered = self.order_by_health(candidates, excluded);
            if ordered.is_empty() {
                return Err(ProxyError::NoAvailableChannel(
                    "所有候选渠道均已尝试".to_string(),
                ));
            }

            let start = self.cursor.fetch_add(1, Ordering::Relaxed) % ordered.len();
            for offset in 0..ordered.len() {
                let (candidate, limiter) = &ordered[(start + offset) % ordered.len()];
                if let Some(permit) = limiter.try_acquire() {
                    return Ok(Selected {
                        channel: candidate.channel.clone(),
                        model: candidate.model.clone(),
                        limiter: limiter.clone(),
                        permit,
                    });
                }
            }

            log::info!(
                "[{}] {} 个候选渠道均已满载，等待渠道 {} 的槽位",
                log_sel::ALL_SATURATED,
                ordered.len(),
                ordered[start].0.channel.name
            );
            ordered[start].clone()
        };

        match tokio::time::timeout(self.acquire_timeout, limiter.acquire()).await {
            Ok(permit) => Ok(Selected {
                channel: candidate.channel,
                model: candidate.model,
                limiter,
                permit,
            }),
            Err(_) => Err(ProxyError::ChannelsSaturated(format!(
                "等待渠道 {} 的并发槽位超时",
                candidate.channel.name
            ))),
        }
    }
}
