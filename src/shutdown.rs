use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info};

/// 优雅关闭管理器
///
/// 关闭状态保存在 watch 通道里，晚于关闭才订阅的接收者也能立即看到。
#[derive(Clone)]
pub struct ShutdownManager {
    shutdown_tx: Arc<watch::Sender<bool>>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            shutdown_tx: Arc::new(shutdown_tx),
        }
    }

    /// 订阅关闭信号
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// 触发关闭，重复调用无效果
    pub fn shutdown(&self) {
        let already = self.shutdown_tx.send_replace(true);
        if already {
            debug!("关闭管理器已经触发过关闭");
            return;
        }
        info!(
            "触发系统关闭，通知 {} 个订阅者",
            self.shutdown_tx.receiver_count()
        );
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// 等待关闭被触发
    pub async fn wait_for_shutdown(&self) {
        let mut rx = self.subscribe();
        // 发送端由 self 持有，wait_for 只会在值为 true 时返回
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}
