use serde::{Deserialize, Serialize};
use std::fmt;
use utoipa::ToSchema;

/// 镜像内容寻址标识（sha256摘要的十六进制字符串）
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema)]
#[serde(transparent)]
pub struct ImageSha(pub String);

impl ImageSha {
    pub fn new<T: Into<String>>(sha: T) -> Self {
        Self(sha.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ImageSha {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ImageSha {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// 容器镜像
///
/// 镜像一经构造不可变，相等性只按Sha判断：同一镜像可能以不同的
/// registry/tag组合出现在多个Pod里，但扫描只需要做一次。
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Image {
    /// 内容寻址标识，全局唯一
    pub sha: ImageSha,
    /// 镜像仓库地址
    pub registry: String,
    /// 镜像名称（含命名空间）
    pub repository: String,
    /// 镜像标签
    pub tag: String,
}

impl Image {
    pub fn new<S, R, P, T>(sha: S, registry: R, repository: P, tag: T) -> Self
    where
        S: Into<ImageSha>,
        R: Into<String>,
        P: Into<String>,
        T: Into<String>,
    {
        Self {
            sha: sha.into(),
            registry: registry.into(),
            repository: repository.into(),
            tag: tag.into(),
        }
    }

    /// Hub侧项目名，作为扫描（code location）的键
    ///
    /// 仓库名里的斜杠替换为连字符，再拼接sha前缀保证唯一。
    pub fn hub_project_name(&self) -> String {
        let repo = self.repository.replace('/', "-");
        format!("{}-{}", repo, self.sha_prefix())
    }

    fn sha_prefix(&self) -> String {
        self.sha.as_str().chars().take(20).collect()
    }
}

impl From<String> for ImageSha {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// 相等性只看Sha
impl PartialEq for Image {
    fn eq(&self, other: &Self) -> bool {
        self.sha == other.sha
    }
}

impl Eq for Image {}

impl std::hash::Hash for Image {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.sha.hash(state);
    }
}
