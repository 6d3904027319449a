// ==========================================
// 仓储导入对账系统 - 批次编排器
// ==========================================
// 职责: 分批、驱动批次处理（重试/退避/单次超时/取消）、批次间节流
// 状态机: Pending → Running → {Succeeded, Retrying → Running, Failed} | Cancelled
// 约束:
// - 超时计为一次失败尝试
// - 被打断的尝试须等待处理步骤返回；已生效的写入按成功记账
// - 重试耗尽：每行生成一条错误
// - 不可重试错误：批次直接失败
// - 节流只发生在批次之间（不在重试之间）
// - 取消在每个挂起点检查；已完成批次保留
// - 默认顺序执行；并行模式保持提交顺序
// ==========================================

use crate::config::{ImportSettings, RetryBackoff};
use crate::domain::{
    BatchResult, BatchStatus, DeltaStats, ErrorEntry, RecordGroup, SourceRow,
};
use crate::engine::error::{BatchError, BatchResultOf};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

// ==========================================
// BatchItem - 可分批的条目
// ==========================================
// SourceRow: 一行
// RecordGroup: 预分组的多行（分组不会跨批次）
pub trait BatchItem: Clone + Send + Sync + 'static {
    fn row_numbers(&self) -> Vec<usize>;

    fn row_count(&self) -> usize {
        self.row_numbers().len()
    }
}

impl BatchItem for SourceRow {
    fn row_numbers(&self) -> Vec<usize> {
        vec![self.row_number]
    }

    fn row_count(&self) -> usize {
        1
    }
}

impl BatchItem for RecordGroup {
    fn row_numbers(&self) -> Vec<usize> {
        self.records.iter().map(|r| r.row_number).collect()
    }

    fn row_count(&self) -> usize {
        self.records.len()
    }
}

// ==========================================
// Batch - 重试单元（创建后不可变）
// ==========================================
#[derive(Debug, Clone)]
pub struct Batch<T> {
    pub index: usize, // 从 1 开始
    pub items: Arc<[T]>,
}

impl<T: BatchItem> Batch<T> {
    pub fn row_count(&self) -> usize {
        self.items.iter().map(BatchItem::row_count).sum()
    }

    pub fn row_numbers(&self) -> Vec<usize> {
        self.items.iter().flat_map(BatchItem::row_numbers).collect()
    }
}

/// 按 size 切分为 ceil(N/size) 个批次，保持输入顺序
pub fn partition<T: BatchItem>(items: Vec<T>, size: usize) -> Vec<Batch<T>> {
    let size = size.max(1);
    let mut batches = Vec::with_capacity(items.len().div_ceil(size));
    let mut iter = items.into_iter().peekable();
    let mut index = 0;

    while iter.peek().is_some() {
        index += 1;
        let chunk: Vec<T> = iter.by_ref().take(size).collect();
        batches.push(Batch {
            index,
            items: chunk.into(),
        });
    }
    batches
}

// ==========================================
// BatchProcessor - 批次处理步骤
// ==========================================
/// 单次尝试的成功结果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchOutcome {
    pub succeeded_rows: usize,
    pub errors: Vec<ErrorEntry>, // 批次成功但个别行被外部拒绝
    pub delta: DeltaStats,
}

#[async_trait]
pub trait BatchProcessor<T: BatchItem>: Send + Sync {
    /// 处理一个批次（一次尝试）
    ///
    /// # 参数
    /// - attempt: 从 1 开始的尝试序号
    /// - cancel: 本次尝试的取消令牌（外部取消或超时时触发）
    ///
    /// # 约束
    /// - 失败时不得留下部分写入
    /// - cancel 触发后应尽快返回；返回 Ok 表示写入已生效
    async fn process(
        &self,
        batch: &Batch<T>,
        attempt: u32,
        cancel: CancellationToken,
    ) -> BatchResultOf<BatchOutcome>;
}

// ==========================================
// OrchestratorSettings
// ==========================================
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorSettings {
    pub max_attempts: u32,
    pub attempt_timeout: Duration,
    pub retry_delay: Duration,
    pub retry_backoff: RetryBackoff,
    pub pacing_delay: Duration,
    pub parallel: bool,
    pub max_parallel: usize,
}

impl From<&ImportSettings> for OrchestratorSettings {
    fn from(s: &ImportSettings) -> Self {
        Self {
            max_attempts: s.effective_attempts(),
            attempt_timeout: s.attempt_timeout,
            retry_delay: s.retry_delay,
            retry_backoff: s.retry_backoff,
            pacing_delay: s.pacing_delay,
            parallel: s.parallel_processing,
            max_parallel: s.max_parallel_batches.max(1),
        }
    }
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from(&ImportSettings::default())
    }
}

// ==========================================
// BatchOrchestrator
// ==========================================
pub struct BatchOrchestrator {
    settings: OrchestratorSettings,
}

impl BatchOrchestrator {
    pub fn new(settings: OrchestratorSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    /// 驱动全部批次
    ///
    /// # 返回
    /// - 每个批次一条 BatchResult（按批次序号）
    /// - 取消后未开始的批次状态为 Cancelled、attempts = 0
    #[instrument(skip_all, fields(batches = batches.len(), parallel = self.settings.parallel))]
    pub async fn run<T, P>(
        &self,
        batches: Vec<Batch<T>>,
        processor: &P,
        cancel: &CancellationToken,
    ) -> Vec<BatchResult>
    where
        T: BatchItem,
        P: BatchProcessor<T> + ?Sized,
    {
        if self.settings.parallel && self.settings.max_parallel > 1 {
            // buffered: 并发执行，结果保持提交顺序
            stream::iter(batches)
                .map(|batch| async move { self.run_batch(&batch, processor, cancel).await })
                .buffered(self.settings.max_parallel)
                .collect()
                .await
        } else {
            self.run_sequential(batches, processor, cancel).await
        }
    }

    async fn run_sequential<T, P>(
        &self,
        batches: Vec<Batch<T>>,
        processor: &P,
        cancel: &CancellationToken,
    ) -> Vec<BatchResult>
    where
        T: BatchItem,
        P: BatchProcessor<T> + ?Sized,
    {
        let mut results = Vec::with_capacity(batches.len());

        for (pos, batch) in batches.iter().enumerate() {
            if pos > 0 && !self.settings.pacing_delay.is_zero() && !cancel.is_cancelled() {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(self.settings.pacing_delay) => {}
                }
            }

            if cancel.is_cancelled() {
                results.push(cancelled_result(batch, 0, Instant::now()));
                continue;
            }

            results.push(self.run_batch(batch, processor, cancel).await);
        }

        results
    }

    /// 单批次：重试循环
    async fn run_batch<T, P>(
        &self,
        batch: &Batch<T>,
        processor: &P,
        cancel: &CancellationToken,
    ) -> BatchResult
    where
        T: BatchItem,
        P: BatchProcessor<T> + ?Sized,
    {
        let start = Instant::now();
        let max_attempts = self.settings.max_attempts.max(1);
        let mut attempts: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return cancelled_result(batch, attempts, start);
            }

            attempts += 1;
            info!(
                batch = batch.index,
                attempt = attempts,
                rows = batch.row_count(),
                status = %BatchStatus::Running,
                "批次开始处理"
            );

            let attempt_token = cancel.child_token();
            let result = self
                .run_attempt(batch, processor, attempts, cancel, attempt_token)
                .await;

            match result {
                Ok(outcome) => {
                    let elapsed_ms = start.elapsed().as_millis() as u64;
                    info!(
                        batch = batch.index,
                        attempts,
                        succeeded = outcome.succeeded_rows,
                        rejected = outcome.errors.len(),
                        elapsed_ms,
                        "批次处理成功"
                    );
                    return BatchResult {
                        batch_index: batch.index,
                        status: BatchStatus::Succeeded,
                        attempts,
                        row_count: batch.row_count(),
                        succeeded_rows: outcome.succeeded_rows,
                        errors: outcome
                            .errors
                            .into_iter()
                            .map(|mut e| {
                                e.batch_index = Some(batch.index);
                                e
                            })
                            .collect(),
                        delta: outcome.delta,
                        elapsed_ms,
                    };
                }
                Err(BatchError::Cancelled) => {
                    warn!(batch = batch.index, attempts, "批次被取消");
                    return cancelled_result(batch, attempts, start);
                }
                Err(e) if !e.is_retryable() => {
                    warn!(batch = batch.index, attempts, error = %e, "批次遇到不可重试错误");
                    let message = e.to_string();
                    return failed_result(batch, attempts, &e, message, start);
                }
                Err(e) => {
                    if attempts >= max_attempts {
                        warn!(batch = batch.index, attempts, error = %e, "批次重试耗尽");
                        let message = format!("{} 次尝试后仍失败: {}", attempts, e);
                        return failed_result(batch, attempts, &e, message, start);
                    }

                    let delay = self
                        .settings
                        .retry_backoff
                        .delay(self.settings.retry_delay, attempts);
                    warn!(
                        batch = batch.index,
                        attempt = attempts,
                        status = %BatchStatus::Retrying,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "批次失败，等待重试"
                    );

                    tokio::select! {
                        _ = cancel.cancelled() => return cancelled_result(batch, attempts, start),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// 单次尝试
    ///
    /// 外部取消或超时时先取消 attempt_token，再等待处理步骤真正返回:
    /// 处理步骤可能已越过最后一个检查点（如事务已提交），此时按其实际结果记账，
    /// 否则按打断原因记为取消或超时
    async fn run_attempt<T, P>(
        &self,
        batch: &Batch<T>,
        processor: &P,
        attempt: u32,
        cancel: &CancellationToken,
        attempt_token: CancellationToken,
    ) -> BatchResultOf<BatchOutcome>
    where
        T: BatchItem,
        P: BatchProcessor<T> + ?Sized,
    {
        let timeout = self.settings.attempt_timeout;
        let mut fut = processor.process(batch, attempt, attempt_token.clone());

        let interrupt = tokio::select! {
            biased;
            _ = cancel.cancelled() => Interrupt::Cancelled,
            r = &mut fut => return r,
            _ = tokio::time::sleep(timeout) => Interrupt::TimedOut,
        };

        // 通知处理步骤在下一个检查点退出
        attempt_token.cancel();
        match fut.await {
            Ok(outcome) => {
                warn!(batch = batch.index, attempt, "批次在打断前已完成提交，按成功记账");
                Ok(outcome)
            }
            Err(e) => {
                let interrupted = match interrupt {
                    Interrupt::Cancelled => BatchError::Cancelled,
                    Interrupt::TimedOut => BatchError::Timeout(timeout),
                };
                info!(batch = batch.index, attempt, error = %e, "被打断的尝试已退出");
                Err(interrupted)
            }
        }
    }
}

/// 尝试被打断的原因
enum Interrupt {
    Cancelled,
    TimedOut,
}

fn cancelled_result<T: BatchItem>(batch: &Batch<T>, attempts: u32, start: Instant) -> BatchResult {
    BatchResult {
        batch_index: batch.index,
        status: BatchStatus::Cancelled,
        attempts,
        row_count: batch.row_count(),
        succeeded_rows: 0,
        errors: Vec::new(),
        delta: DeltaStats::default(),
        elapsed_ms: start.elapsed().as_millis() as u64,
    }
}

/// 失败批次：每行一条错误
fn failed_result<T: BatchItem>(
    batch: &Batch<T>,
    attempts: u32,
    error: &BatchError,
    message: String,
    start: Instant,
) -> BatchResult {
    let kind = error.kind();
    let errors = batch
        .row_numbers()
        .into_iter()
        .map(|row| ErrorEntry::for_row(kind, batch.index, row, message.clone()))
        .collect();

    BatchResult {
        batch_index: batch.index,
        status: BatchStatus::Failed,
        attempts,
        row_count: batch.row_count(),
        succeeded_rows: 0,
        errors,
        delta: DeltaStats::default(),
        elapsed_ms: start.elapsed().as_millis() as u64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ErrorKind;
    use proptest::prelude::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    fn rows(n: usize) -> Vec<SourceRow> {
        (0..n).map(|i| SourceRow::new(i + 2, HashMap::new())).collect()
    }

    fn fast_settings(max_attempts: u32) -> OrchestratorSettings {
        OrchestratorSettings {
            max_attempts,
            attempt_timeout: Duration::from_secs(5),
            retry_delay: Duration::from_millis(1),
            retry_backoff: RetryBackoff::Fixed,
            pacing_delay: Duration::ZERO,
            parallel: false,
            max_parallel: 1,
        }
    }

    /// 记录每个批次的尝试次数；fail_batches 中的批次前 fail_times 次失败
    struct ScriptedProcessor {
        calls: Mutex<Vec<(usize, u32)>>,
        fail_batches: Vec<usize>,
        fail_times: u32,
        error: fn() -> BatchError,
    }

    impl ScriptedProcessor {
        fn new(fail_batches: Vec<usize>, fail_times: u32, error: fn() -> BatchError) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                fail_batches,
                fail_times,
                error,
            }
        }

        fn attempts_for(&self, batch: usize) -> usize {
            self.calls.lock().unwrap().iter().filter(|(b, _)| *b == batch).count()
        }
    }

    #[async_trait]
    impl BatchProcessor<SourceRow> for ScriptedProcessor {
        async fn process(
            &self,
            batch: &Batch<SourceRow>,
            attempt: u32,
            _cancel: CancellationToken,
        ) -> BatchResultOf<BatchOutcome> {
            self.calls.lock().unwrap().push((batch.index, attempt));
            if self.fail_batches.contains(&batch.index) && attempt <= self.fail_times {
                return Err((self.error)());
            }
            Ok(BatchOutcome {
                succeeded_rows: batch.row_count(),
                ..Default::default()
            })
        }
    }

    #[test]
    fn test_partition_sizes() {
        let batches = partition(rows(2500), 500);
        assert_eq!(batches.len(), 5);
        assert!(batches.iter().all(|b| b.items.len() == 500));
        assert_eq!(batches[4].index, 5);

        let batches = partition(rows(7), 3);
        assert_eq!(batches.iter().map(|b| b.items.len()).collect::<Vec<_>>(), vec![3, 3, 1]);
        assert!(partition(Vec::<SourceRow>::new(), 10).is_empty());
    }

    proptest! {
        #[test]
        fn prop_partition_preserves_order(n in 0usize..300, size in 1usize..50) {
            let batches = partition(rows(n), size);
            prop_assert_eq!(batches.len(), n.div_ceil(size));
            let flattened: Vec<usize> = batches.iter().flat_map(|b| b.row_numbers()).collect();
            let expected: Vec<usize> = (0..n).map(|i| i + 2).collect();
            prop_assert_eq!(flattened, expected);
            prop_assert!(batches.iter().all(|b| b.items.len() <= size));
        }
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let orchestrator = BatchOrchestrator::new(fast_settings(3));
        let processor = ScriptedProcessor::new(vec![1], 2, || BatchError::ExternalProcessing("boom".into()));

        let results = orchestrator
            .run(partition(rows(4), 2), &processor, &CancellationToken::new())
            .await;

        assert_eq!(results[0].status, BatchStatus::Succeeded);
        assert_eq!(results[0].attempts, 3);
        assert_eq!(results[1].attempts, 1);
        assert!(results[0].errors.is_empty());
    }

    #[tokio::test]
    async fn test_retry_exhaustion_yields_error_per_row() {
        let orchestrator = BatchOrchestrator::new(fast_settings(2));
        let processor = ScriptedProcessor::new(vec![1], u32::MAX, || {
            BatchError::ExternalProcessing("loader exit 1".into())
        });

        let results = orchestrator
            .run(partition(rows(3), 3), &processor, &CancellationToken::new())
            .await;

        assert_eq!(processor.attempts_for(1), 2);
        assert_eq!(results[0].status, BatchStatus::Failed);
        assert_eq!(results[0].errors.len(), 3);
        assert!(results[0].errors.iter().all(|e| e.kind == ErrorKind::ExternalProcessing));
        assert!(results[0].errors[0].message.starts_with("2 次尝试后仍失败"));
    }

    #[tokio::test]
    async fn test_non_retryable_fails_immediately() {
        let orchestrator = BatchOrchestrator::new(fast_settings(3));
        let processor = ScriptedProcessor::new(vec![1], u32::MAX, || BatchError::MissingMapping {
            category: crate::domain::EntityCategory::Order,
            key: "PO1".into(),
        });

        let results = orchestrator
            .run(partition(rows(2), 2), &processor, &CancellationToken::new())
            .await;

        assert_eq!(processor.attempts_for(1), 1);
        assert_eq!(results[0].status, BatchStatus::Failed);
        assert!(results[0].errors.iter().all(|e| e.kind == ErrorKind::Internal));
    }

    struct SlowProcessor;

    #[async_trait]
    impl BatchProcessor<SourceRow> for SlowProcessor {
        async fn process(
            &self,
            _batch: &Batch<SourceRow>,
            _attempt: u32,
            cancel: CancellationToken,
        ) -> BatchResultOf<BatchOutcome> {
            tokio::select! {
                _ = cancel.cancelled() => Err(BatchError::Cancelled),
                _ = tokio::time::sleep(Duration::from_secs(10)) => Ok(BatchOutcome::default()),
            }
        }
    }

    #[tokio::test]
    async fn test_timeout_counts_as_attempt() {
        let mut settings = fast_settings(2);
        settings.attempt_timeout = Duration::from_millis(20);
        let orchestrator = BatchOrchestrator::new(settings);

        let results = orchestrator
            .run(partition(rows(1), 1), &SlowProcessor, &CancellationToken::new())
            .await;

        assert_eq!(results[0].status, BatchStatus::Failed);
        assert_eq!(results[0].attempts, 2);
        assert!(results[0].errors[0].message.contains("超时"));
    }

    /// 忽略取消信号、延迟后成功（模拟已越过最后检查点的提交）
    struct LateCommitProcessor {
        delay: Duration,
    }

    #[async_trait]
    impl BatchProcessor<SourceRow> for LateCommitProcessor {
        async fn process(
            &self,
            batch: &Batch<SourceRow>,
            _attempt: u32,
            _cancel: CancellationToken,
        ) -> BatchResultOf<BatchOutcome> {
            tokio::time::sleep(self.delay).await;
            Ok(BatchOutcome {
                succeeded_rows: batch.row_count(),
                ..Default::default()
            })
        }
    }

    #[tokio::test]
    async fn test_commit_landing_after_timeout_is_success() {
        let mut settings = fast_settings(2);
        settings.attempt_timeout = Duration::from_millis(20);
        let orchestrator = BatchOrchestrator::new(settings);
        let processor = LateCommitProcessor {
            delay: Duration::from_millis(150),
        };

        let results = orchestrator
            .run(partition(rows(3), 3), &processor, &CancellationToken::new())
            .await;

        // 不重试、不报失败: 写入已生效
        assert_eq!(results[0].status, BatchStatus::Succeeded);
        assert_eq!(results[0].attempts, 1);
        assert_eq!(results[0].succeeded_rows, 3);
        assert!(results[0].errors.is_empty());
    }

    #[tokio::test]
    async fn test_commit_landing_after_cancel_is_success() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let processor = LateCommitProcessor {
            delay: Duration::from_millis(150),
        };
        let results = BatchOrchestrator::new(fast_settings(1))
            .run(partition(rows(4), 2), &processor, &cancel)
            .await;

        assert_eq!(results[0].status, BatchStatus::Succeeded);
        assert_eq!(results[0].succeeded_rows, 2);
        assert_eq!(results[1].status, BatchStatus::Cancelled);
        assert_eq!(results[1].attempts, 0);
    }

    /// 第 cancel_after 个批次完成后触发取消
    struct CancellingProcessor {
        cancel: CancellationToken,
        cancel_after: usize,
        seen: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl BatchProcessor<SourceRow> for CancellingProcessor {
        async fn process(
            &self,
            batch: &Batch<SourceRow>,
            _attempt: u32,
            _cancel: CancellationToken,
        ) -> BatchResultOf<BatchOutcome> {
            self.seen.lock().unwrap().push(batch.index);
            if batch.index == self.cancel_after {
                self.cancel.cancel();
            }
            Ok(BatchOutcome {
                succeeded_rows: batch.row_count(),
                ..Default::default()
            })
        }
    }

    #[tokio::test]
    async fn test_cancellation_preserves_completed_batches() {
        let cancel = CancellationToken::new();
        let processor = CancellingProcessor {
            cancel: cancel.clone(),
            cancel_after: 2,
            seen: Mutex::new(Vec::new()),
        };
        let mut settings = fast_settings(3);
        settings.pacing_delay = Duration::from_millis(5);
        let orchestrator = BatchOrchestrator::new(settings);

        let results = orchestrator.run(partition(rows(10), 2), &processor, &cancel).await;

        assert_eq!(*processor.seen.lock().unwrap(), vec![1, 2]);
        assert_eq!(results.len(), 5);
        assert_eq!(results[0].status, BatchStatus::Succeeded);
        assert_eq!(results[1].status, BatchStatus::Succeeded);
        assert!(results[2..]
            .iter()
            .all(|r| r.status == BatchStatus::Cancelled && r.attempts == 0));
    }

    #[tokio::test]
    async fn test_parallel_mode_keeps_submission_order() {
        let mut settings = fast_settings(1);
        settings.parallel = true;
        settings.max_parallel = 3;
        let orchestrator = BatchOrchestrator::new(settings);
        let processor = ScriptedProcessor::new(vec![], 0, || BatchError::Internal("unused".into()));

        let results = orchestrator
            .run(partition(rows(9), 2), &processor, &CancellationToken::new())
            .await;

        assert_eq!(
            results.iter().map(|r| r.batch_index).collect::<Vec<_>>(),
            vec![1, 2, 3, 4, 5]
        );
        assert!(results.iter().all(|r| r.status == BatchStatus::Succeeded));
    }
}
