//! Forager - 自主网页智能体的认知控制器
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误分类、重试策略、环境适配器、Controller 主循环与并行调度
//! - **llm**: LLM 客户端抽象与 Mock 实现
//! - **memory**: 状态指纹、情景记忆、工作记忆与持久化
//! - **observability**: tracing 初始化
//! - **react**: 动作解析、分层计划、Critic、提议者与过程事件

pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod react;
