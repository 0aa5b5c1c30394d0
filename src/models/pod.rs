use super::Image;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// 集群Pod
///
/// `name` 为限定名（namespace/name），在集群模型里唯一。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Pod {
    /// 限定名，如 `default/nginx-7d9c`
    pub name: String,
    /// 容器列表
    pub containers: Vec<Container>,
}

/// Pod内的单个容器
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Container {
    /// 容器名
    pub name: String,
    /// 容器镜像
    pub image: Image,
}

impl Pod {
    pub fn new<T: Into<String>>(name: T, containers: Vec<Container>) -> Self {
        Self {
            name: name.into(),
            containers,
        }
    }

    /// Pod引用的全部镜像
    pub fn images(&self) -> impl Iterator<Item = &Image> {
        self.containers.iter().map(|c| &c.image)
    }
}

impl Container {
    pub fn new<T: Into<String>>(name: T, image: Image) -> Self {
        Self {
            name: name.into(),
            image,
        }
    }
}
