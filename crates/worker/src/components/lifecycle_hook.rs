use std::panic::AssertUnwindSafe;

use async_trait::async_trait;
use futures::FutureExt;
use tracing::{debug, error};

/// 分片所有权变化的回调
///
/// 回调返回的错误和 panic 都会被捕获并记录，不影响消费者本身。
#[async_trait]
pub trait ShardLifecycleHook: Send + Sync {
    async fn on_shard_acquired(&self, _stream_id: &str, _shard_id: &str) -> anyhow::Result<()> {
        Ok(())
    }

    /// 租约被其他实例夺走
    async fn on_shard_lost(&self, _stream_id: &str, _shard_id: &str) -> anyhow::Result<()> {
        Ok(())
    }

    /// 主动交出或消费结束
    async fn on_shard_released(&self, _stream_id: &str, _shard_id: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

pub struct NoopLifecycleHook;

#[async_trait]
impl ShardLifecycleHook for NoopLifecycleHook {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookEvent {
    Acquired,
    Lost,
    Released,
}

impl HookEvent {
    fn as_str(&self) -> &'static str {
        match self {
            HookEvent::Acquired => "on_shard_acquired",
            HookEvent::Lost => "on_shard_lost",
            HookEvent::Released => "on_shard_released",
        }
    }
}

/// 调用回调并吞掉错误与 panic，返回回调是否成功
pub async fn fire_hook(
    hook: &dyn ShardLifecycleHook,
    event: HookEvent,
    stream_id: &str,
    shard_id: &str,
) -> bool {
    let call = async {
        match event {
            HookEvent::Acquired => hook.on_shard_acquired(stream_id, shard_id).await,
            HookEvent::Lost => hook.on_shard_lost(stream_id, shard_id).await,
            HookEvent::Released => hook.on_shard_released(stream_id, shard_id).await,
        }
    };

    match AssertUnwindSafe(call).catch_unwind().await {
        Ok(Ok(())) => {
            debug!("{} {}/{} 完成", event.as_str(), stream_id, shard_id);
            true
        }
        Ok(Err(e)) => {
            error!("{} {}/{} 失败: {:#}", event.as_str(), stream_id, shard_id, e);
            false
        }
        Err(_) => {
            error!("{} {}/{} 发生panic", event.as_str(), stream_id, shard_id);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FaultyHook;

    #[async_trait]
    impl ShardLifecycleHook for FaultyHook {
        async fn on_shard_acquired(&self, _: &str, _: &str) -> anyhow::Result<()> {
            Err(anyhow::anyhow!("cannot warm cache"))
        }

        async fn on_shard_lost(&self, _: &str, _: &str) -> anyhow::Result<()> {
            panic!("hook exploded");
        }
    }

    #[tokio::test]
    async fn test_hook_errors_and_panics_are_contained() {
        assert!(!fire_hook(&FaultyHook, HookEvent::Acquired, "orders", "s1").await);
        assert!(!fire_hook(&FaultyHook, HookEvent::Lost, "orders", "s1").await);
        assert!(fire_hook(&FaultyHook, HookEvent::Released, "orders", "s1").await);
        assert!(fire_hook(&NoopLifecycleHook, HookEvent::Acquired, "orders", "s1").await);
    }
}
