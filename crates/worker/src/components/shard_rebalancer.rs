use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use taskq_core::QueueResult;

use super::shard_consumer::{ConsumerContext, ShardConsumer, ShardConsumerHandle, ShardRegistry};
use crate::shard_manager::ShardManager;

/// 一次再均衡的结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RebalanceOutcome {
    pub acquired: Vec<String>,
    pub released: Vec<String>,
    /// 目标分片中被其他实例持有、本轮未能获取的
    pub contended: Vec<String>,
}

/// 周期性地按存活实例重新分配分片
///
/// 每轮先上报心跳，再计算本实例的目标分片：交出不再属于自己的分片，
/// 为新分到的分片获取租约并启动消费者。心跳失败或本实例不在存活列表中时
/// 交出该流的全部分片。
pub struct ShardRebalancer {
    ctx: Arc<ConsumerContext>,
    manager: ShardManager,
    registry: ShardRegistry,
    shutdown_rx: watch::Receiver<bool>,
}

impl ShardRebalancer {
    pub fn new(ctx: Arc<ConsumerContext>, shutdown_rx: watch::Receiver<bool>) -> Self {
        let manager = ShardManager::new(ctx.stream.clone(), ctx.leaser.instance_id());
        Self {
            ctx,
            manager,
            registry: ShardRegistry::new(),
            shutdown_rx,
        }
    }

    pub fn registry(&self) -> &ShardRegistry {
        &self.registry
    }

    pub fn instance_id(&self) -> &str {
        self.manager.instance_id()
    }

    pub async fn rebalance_once(&self, stream_id: &str) -> QueueResult<RebalanceOutcome> {
        // 心跳失败时其他实例很快会把本实例视为离线，按不在存活列表处理
        if let Err(e) = self.ctx.leaser.heartbeat().await {
            warn!(
                "实例 {} 心跳失败，交出流 {} 的全部分片: {}",
                self.instance_id(),
                stream_id,
                e
            );
            return Ok(self.absent_outcome(stream_id).await);
        }

        let shards = self.manager.list_shards(stream_id).await?;
        if shards.is_empty() {
            debug!("流 {} 没有可用分片，跳过本轮再均衡", stream_id);
            return Ok(RebalanceOutcome::default());
        }

        let instances = self.ctx.leaser.get_active_instances().await?;
        if !instances.iter().any(|i| i == self.instance_id()) {
            warn!(
                "实例 {} 不在存活列表中，交出流 {} 的全部分片",
                self.instance_id(),
                stream_id
            );
            return Ok(self.absent_outcome(stream_id).await);
        }

        let held = self.registry.active_shards(stream_id);
        let assignment = self
            .manager
            .calculate_shard_assignment(&shards, &instances, &held);

        let mut outcome = RebalanceOutcome::default();

        for shard_id in &assignment.shards_to_release {
            if let Some(handle) = self.registry.remove(stream_id, shard_id) {
                handle.stop_and_wait(self.ctx.config.stop_timeout()).await;
            }
            if let Err(e) = self.ctx.leaser.release_lock(stream_id, shard_id).await {
                warn!("释放分片 {}/{} 租约失败: {}", stream_id, shard_id, e);
            }
            outcome.released.push(shard_id.clone());
        }

        for shard_id in assignment.target_shards.difference(&held) {
            match self.ctx.leaser.acquire_lock(stream_id, shard_id).await {
                Ok(true) => {
                    ShardConsumer::spawn(
                        self.ctx.clone(),
                        self.registry.clone(),
                        stream_id,
                        shard_id,
                        self.shutdown_rx.clone(),
                    );
                    outcome.acquired.push(shard_id.clone());
                }
                Ok(false) => {
                    debug!("分片 {}/{} 仍被其他实例持有", stream_id, shard_id);
                    outcome.contended.push(shard_id.clone());
                }
                Err(e) => {
                    warn!("获取分片 {}/{} 租约失败: {}", stream_id, shard_id, e);
                    outcome.contended.push(shard_id.clone());
                }
            }
        }

        metrics::counter!("taskq_rebalance_cycles_total", "stream" => stream_id.to_string())
            .increment(1);
        metrics::gauge!("taskq_owned_shards", "stream" => stream_id.to_string())
            .set(self.registry.active_shards(stream_id).len() as f64);

        if !outcome.acquired.is_empty() || !outcome.released.is_empty() {
            info!(
                "流 {} 再均衡完成: 获取 {:?}, 释放 {:?}",
                stream_id, outcome.acquired, outcome.released
            );
        }
        Ok(outcome)
    }

    async fn absent_outcome(&self, stream_id: &str) -> RebalanceOutcome {
        let released = self.release_stream(stream_id).await;
        metrics::gauge!("taskq_owned_shards", "stream" => stream_id.to_string())
            .set(self.registry.active_shards(stream_id).len() as f64);
        RebalanceOutcome {
            released,
            ..Default::default()
        }
    }

    async fn release_stream(&self, stream_id: &str) -> Vec<String> {
        let handles = self.registry.drain_stream(stream_id);
        self.stop_all(handles).await
    }

    async fn stop_all(&self, handles: Vec<Arc<ShardConsumerHandle>>) -> Vec<String> {
        let mut released = Vec::with_capacity(handles.len());
        for handle in handles {
            handle.stop_and_wait(self.ctx.config.stop_timeout()).await;
            if let Err(e) = self
                .ctx
                .leaser
                .release_lock(handle.stream_id(), handle.shard_id())
                .await
            {
                warn!(
                    "释放分片 {}/{} 租约失败: {}",
                    handle.stream_id(),
                    handle.shard_id(),
                    e
                );
            }
            released.push(handle.shard_id().to_string());
        }
        released
    }

    /// 为每个配置的流启动再均衡循环
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        self.ctx
            .config
            .streams
            .iter()
            .map(|stream_id| tokio::spawn(self.clone().run_loop(stream_id.clone())))
            .collect()
    }

    async fn run_loop(self: Arc<Self>, stream_id: String) {
        let mut shutdown = self.shutdown_rx.clone();
        let mut ticker = interval(self.ctx.config.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            "流 {} 的分片再均衡已启动，间隔 {:?}",
            stream_id,
            self.ctx.config.interval()
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.rebalance_once(&stream_id).await {
                        error!("流 {} 再均衡失败: {}", stream_id, e);
                    }
                }
                _ = shutdown.changed() => {
                    info!("收到关闭信号，停止流 {} 的再均衡", stream_id);
                    break;
                }
            }
        }
    }

    /// 停止全部消费者、释放租约并注销实例
    pub async fn shutdown(&self) {
        let handles = self.registry.drain_all();
        let released = self.stop_all(handles).await;
        info!("实例 {} 已交出 {} 个分片", self.instance_id(), released.len());

        if let Err(e) = self.ctx.leaser.deregister().await {
            warn!("注销实例 {} 失败: {}", self.instance_id(), e);
        }
    }
}
