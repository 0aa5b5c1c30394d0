use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// 统一API响应格式
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ApiResponse<T> {
    /// 业务响应码
    pub code: i32,
    /// 响应消息（中文）
    pub msg: String,
    /// 响应数据
    pub data: Option<T>,
}

impl<T> ApiResponse<T>
where
    T: Serialize,
{
    /// 创建成功响应
    pub fn success(data: T) -> Self {
        Self {
            code: ResponseCode::SUCCESS,
            msg: "操作成功".to_string(),
            data: Some(data),
        }
    }

    /// 创建成功响应（无数据）
    pub fn success_empty() -> ApiResponse<()> {
        ApiResponse {
            code: ResponseCode::SUCCESS,
            msg: "操作成功".to_string(),
            data: None,
        }
    }

    /// 创建错误响应
    pub fn error(code: i32, msg: String) -> ApiResponse<()> {
        ApiResponse {
            code,
            msg,
            data: None,
        }
    }
}

impl<T> IntoResponse for ApiResponse<T>
where
    T: Serialize,
{
    fn into_response(self) -> Response {
        // 根据业务响应码确定HTTP状态码
        let status = match self.code {
            ResponseCode::SUCCESS => StatusCode::OK,
            ResponseCode::BAD_REQUEST => StatusCode::BAD_REQUEST,
            ResponseCode::NOT_FOUND => StatusCode::NOT_FOUND,
            ResponseCode::HUB_ERROR => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        (status, Json(self)).into_response()
    }
}

/// 业务响应码常量
pub struct ResponseCode;

impl ResponseCode {
    /// 成功响应码
    pub const SUCCESS: i32 = 200;

    /// 客户端错误 4xx
    pub const BAD_REQUEST: i32 = 400;
    pub const NOT_FOUND: i32 = 404;

    /// 服务器错误 5xx
    pub const INTERNAL_ERROR: i32 = 500;
    pub const HUB_ERROR: i32 = 502;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_success_response() {
        let response = ApiResponse::success(json!({"sha": "abc", "status": "Unscanned"}));
        assert_eq!(response.code, 200);
        assert_eq!(response.msg, "操作成功");
        assert!(response.data.is_some());
    }

    #[test]
    fn test_error_response() {
        let response = ApiResponse::<()>::error(502, "Hub不可用".to_string());
        assert_eq!(response.code, 502);
        assert_eq!(response.msg, "Hub不可用");
        assert!(response.data.is_none());
    }
}
