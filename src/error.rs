use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::response::{ApiResponse, ResponseCode};

/// 应用程序错误类型
#[derive(Error, Debug)]
pub enum AppError {
    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("配置错误: {0}")]
    Config(String),

    #[error("Hub请求错误: {0}")]
    Hub(String),

    #[error("Hub协议错误: {0}")]
    Protocol(String),

    #[error("熔断器已打开: {host}")]
    CircuitOpen { host: String },

    #[error("Hub不存在: {host}")]
    HubNotFound { host: String },

    #[error("定时器错误: {0}")]
    Timer(String),

    #[error("内部错误: {0}")]
    Internal(#[from] anyhow::Error),

    #[error("请求参数错误: {0}")]
    BadRequest(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (code, message) = match &self {
            AppError::Serialization(_) => {
                (ResponseCode::INTERNAL_ERROR, "数据序列化错误".to_string())
            }
            AppError::Io(_) => (ResponseCode::INTERNAL_ERROR, "IO错误".to_string()),
            AppError::Config(_) => (ResponseCode::INTERNAL_ERROR, "配置错误".to_string()),
            AppError::Hub(_) => (ResponseCode::HUB_ERROR, self.to_string()),
            AppError::Protocol(_) => (ResponseCode::HUB_ERROR, self.to_string()),
            AppError::CircuitOpen { .. } => (ResponseCode::HUB_ERROR, self.to_string()),
            AppError::HubNotFound { .. } => (ResponseCode::NOT_FOUND, self.to_string()),
            AppError::Timer(_) => (ResponseCode::INTERNAL_ERROR, self.to_string()),
            AppError::Internal(_) => (ResponseCode::INTERNAL_ERROR, "服务器内部错误".to_string()),
            AppError::BadRequest(msg) => (ResponseCode::BAD_REQUEST, msg.clone()),
        };

        // 记录错误日志
        tracing::error!("应用错误: {}", self);

        ApiResponse::<()>::error(code, message).into_response()
    }
}

/// 应用程序Result类型别名
pub type AppResult<T> = Result<T, AppError>;

/// 错误构造辅助函数
impl AppError {
    pub fn config<T: Into<String>>(msg: T) -> Self {
        Self::Config(msg.into())
    }

    pub fn hub<T: Into<String>>(msg: T) -> Self {
        Self::Hub(msg.into())
    }

    pub fn protocol<T: Into<String>>(msg: T) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn circuit_open<T: Into<String>>(host: T) -> Self {
        Self::CircuitOpen { host: host.into() }
    }

    pub fn hub_not_found<T: Into<String>>(host: T) -> Self {
        Self::HubNotFound { host: host.into() }
    }

    pub fn timer<T: Into<String>>(msg: T) -> Self {
        Self::Timer(msg.into())
    }

    pub fn bad_request<T: Into<String>>(msg: T) -> Self {
        Self::BadRequest(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = AppError::hub("登录失败");
        assert!(matches!(err, AppError::Hub(_)));
        assert_eq!(err.to_string(), "Hub请求错误: 登录失败");
    }

    #[test]
    fn test_circuit_open_error() {
        let err = AppError::circuit_open("hub1.example.com");
        assert!(matches!(err, AppError::CircuitOpen { .. }));
        assert_eq!(err.to_string(), "熔断器已打开: hub1.example.com");
    }

    #[test]
    fn test_hub_not_found_error() {
        let err = AppError::hub_not_found("unknown.example.com");
        assert!(matches!(err, AppError::HubNotFound { .. }));
    }
}
