//! 产品类型解析
//!
//! 将生产方传入的自由文本产品标识映射为封闭的产品类型集合，大小写不敏感。
//! 无法识别的取值统一落到 `Unknown`，它是合法的终态而不是错误。

use std::fmt;

/// 产品类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProductType {
    Router,
    BroadbandLine,
    Handset,
    Unknown,
}

impl ProductType {
    /// 已注册开通流程的产品类型
    pub const KNOWN: [ProductType; 3] = [
        ProductType::Router,
        ProductType::BroadbandLine,
        ProductType::Handset,
    ];

    /// 解析产品类型字符串
    ///
    /// 全函数：`None`、空串以及任何未知取值都返回 `Unknown`。
    pub fn resolve(raw: Option<&str>) -> Self {
        let Some(raw) = raw else {
            return Self::Unknown;
        };

        match raw.to_lowercase().as_str() {
            "router" => Self::Router,
            "broadband_line" => Self::BroadbandLine,
            "handset" => Self::Handset,
            _ => Self::Unknown,
        }
    }

    /// 线上报文中使用的小写下划线名称
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Router => "router",
            Self::BroadbandLine => "broadband_line",
            Self::Handset => "handset",
            Self::Unknown => "unknown",
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown)
    }
}

impl fmt::Display for ProductType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
