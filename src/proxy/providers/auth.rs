//! Authentication Types
//!
//! 渠道凭证与注入方式。

/// 认证信息
#[derive(Debug, Clone)]
pub struct AuthInfo {
    /// 渠道凭证
    pub api_key: String,
    /// 认证策略
    pub strategy: AuthStrategy,
}

impl AuthInfo {
    pub fn new(api_key: impl Into<String>, strategy: AuthStrategy) -> Self {
        Self {
            api_key: api_key.into(),
            strategy,
        }
    }

    /// 返回遮蔽后的凭证（用于日志输出）
    ///
    /// 显示前4位和后4位，中间用 `...` 代替；不足 9 位时返回 `***`
    pub fn masked_key(&self) -> String {
        mask_secret(&self.api_key)
    }
}

/// 遮蔽任意密钥
pub fn mask_secret(secret: &str) -> String {
    if secret.chars().count() > 8 {
        let prefix: String = secret.chars().take(4).collect();
        let suffix: String = secret
            .chars()
            .rev()
            .take(4)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        format!("{prefix}...{suffix}")
    } else {
        "***".to_string()
    }
}

/// 认证策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStrategy {
    /// Anthropic 认证方式
    /// - Header: `x-api-key: <api_key>`
    /// - Header: `anthropic-version: 2023-06-01`
    Anthropic,

    /// Bearer Token 认证方式（OpenAI 兼容渠道）
    ///
    /// - Header: `Authorization: Bearer <api_key>`
    Bearer,

    /// Google API Key，放在查询参数 `key=<api_key>` 中
    GoogleQuery,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_masked_key_long() {
        let auth = AuthInfo::new("sk-1234567890abcdef", AuthStrategy::Bearer);
        assert_eq!(auth.masked_key(), "sk-1...cdef");
    }

    #[test]
    fn test_masked_key_short() {
        let auth = AuthInfo::new("12345678", AuthStrategy::Anthropic);
        assert_eq!(auth.masked_key(), "***");
    }

    #[test]
    fn test_masked_key_utf8_safe() {
        let masked = mask_secret("测试⚠️1234567890");
        assert!(masked.ends_with("7890"));
    }
}
