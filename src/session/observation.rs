//! 观测存储：每个会话一个按序号追加的分区
//!
//! 内存中保留最近 `capacity` 条（`Arc<Observation>`，Planner 只借用不复制），
//! 同时写穿到 KvStore；进程重启后按分区懒加载。超出容量的最旧条目同时从内存与 KV 中删除。
//! 已接受的序号另存为区间集合，不随淘汰删除，重放已淘汰的序号仍判为重复。

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::debug;

use crate::core::{CoachError, StoreError};
use crate::session::FrameSubmission;
use crate::stage::PerceptionOutput;
use crate::store::{self, KvStore};

/// 一条已接受的观测（不可变）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub sequence: u64,
    pub image_ref: String,
    pub transcript: Option<String>,
    pub scene_summary: String,
    pub state_estimate: Map<String, Value>,
    pub state_delta: Map<String, Value>,
    pub uncertainties: Vec<String>,
    pub salient_objects: Vec<String>,
    pub readable_text: Option<String>,
    pub received_at: DateTime<Utc>,
}

impl Observation {
    pub fn from_perception(
        frame: &FrameSubmission,
        perception: PerceptionOutput,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            sequence: frame.sequence,
            image_ref: frame.image_ref.clone(),
            transcript: frame.transcript.clone(),
            scene_summary: perception.scene_summary,
            state_estimate: perception.state_estimate,
            state_delta: perception.state_delta,
            uncertainties: perception.uncertainties,
            salient_objects: perception.salient_objects,
            readable_text: perception.readable_text,
            received_at: now,
        }
    }
}

/// 序号检查结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceCheck {
    Fresh,
    Duplicate,
    OutOfOrder { last: u64 },
}

/// append 结果：重复序号为无操作；条目已被淘汰时不再返回内容
#[derive(Debug, Clone)]
pub enum AppendOutcome {
    Appended(Arc<Observation>),
    Duplicate(Option<Arc<Observation>>),
}

/// 已接受序号：按升序的闭区间列表。序号单调递增，连续提交只扩展最后一个区间
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptedSequences {
    ranges: Vec<(u64, u64)>,
}

impl AcceptedSequences {
    pub fn contains(&self, sequence: u64) -> bool {
        let idx = self.ranges.partition_point(|&(_, end)| end < sequence);
        self.ranges
            .get(idx)
            .is_some_and(|&(start, _)| start <= sequence)
    }

    pub fn last(&self) -> Option<u64> {
        self.ranges.last().map(|&(_, end)| end)
    }

    /// 只接受大于 last 的序号，返回是否插入
    pub fn insert(&mut self, sequence: u64) -> bool {
        match self.ranges.last_mut() {
            Some((_, end)) if sequence <= *end => false,
            Some((_, end)) if sequence == *end + 1 => {
                *end = sequence;
                true
            }
            _ => {
                self.ranges.push((sequence, sequence));
                true
            }
        }
    }

    pub fn ranges(&self) -> &[(u64, u64)] {
        &self.ranges
    }
}

#[derive(Debug, Default)]
struct Partition {
    loaded: bool,
    log: VecDeque<Arc<Observation>>,
    accepted: AcceptedSequences,
}

impl Partition {
    fn check(&self, sequence: u64) -> SequenceCheck {
        if self.accepted.contains(sequence) {
            return SequenceCheck::Duplicate;
        }
        match self.accepted.last() {
            Some(last) if sequence <= last => SequenceCheck::OutOfOrder { last },
            _ => SequenceCheck::Fresh,
        }
    }

    fn find(&self, sequence: u64) -> Option<&Arc<Observation>> {
        self.log.iter().find(|o| o.sequence == sequence)
    }

    fn window(&self, n: usize) -> Vec<Arc<Observation>> {
        let skip = self.log.len().saturating_sub(n);
        self.log.iter().skip(skip).cloned().collect()
    }
}

pub struct ObservationStore {
    kv: Arc<dyn KvStore>,
    capacity: usize,
    partitions: Mutex<HashMap<String, Arc<Mutex<Partition>>>>,
}

impl ObservationStore {
    pub fn new(kv: Arc<dyn KvStore>, capacity: usize) -> Self {
        Self {
            kv,
            capacity: capacity.max(1),
            partitions: Mutex::new(HashMap::new()),
        }
    }

    async fn partition(&self, session_id: &str) -> Arc<Mutex<Partition>> {
        let mut partitions = self.partitions.lock().await;
        Arc::clone(partitions.entry(session_id.to_string()).or_default())
    }

    /// 从 KV 读取分区的全部观测（按序号排序）
    async fn read_log(&self, session_id: &str) -> Result<Vec<Observation>, StoreError> {
        self.kv
            .scan_prefix(&store::observation_prefix(session_id))
            .await?
            .into_iter()
            .map(|(key, bytes)| store::decode(&key, &bytes))
            .collect()
    }

    async fn ensure_loaded(
        &self,
        session_id: &str,
        partition: &mut Partition,
    ) -> Result<(), StoreError> {
        if partition.loaded {
            return Ok(());
        }
        let log = self.read_log(session_id).await?;
        let mut accepted: AcceptedSequences =
            store::load_json(self.kv.as_ref(), &store::accepted_sequences_key(session_id))
                .await?
                .unwrap_or_default();
        // 观测已写入但区间集合未写入时，以日志补齐
        for observation in &log {
            accepted.insert(observation.sequence);
        }
        debug!(session_id, count = log.len(), "Rehydrated observation partition");
        partition.log = log.into_iter().map(Arc::new).collect();
        partition.accepted = accepted;
        partition.loaded = true;
        Ok(())
    }

    pub async fn classify(&self, session_id: &str, sequence: u64) -> Result<SequenceCheck, StoreError> {
        let handle = self.partition(session_id).await;
        let mut partition = handle.lock().await;
        self.ensure_loaded(session_id, &mut partition).await?;
        Ok(partition.check(sequence))
    }

    /// 追加观测：先写 KV 再入内存；超容量时淘汰最旧条目
    pub async fn append(
        &self,
        session_id: &str,
        observation: Observation,
    ) -> Result<AppendOutcome, CoachError> {
        let handle = self.partition(session_id).await;
        let mut partition = handle.lock().await;
        self.ensure_loaded(session_id, &mut partition).await?;

        match partition.check(observation.sequence) {
            SequenceCheck::Duplicate => {
                let existing = partition.find(observation.sequence).cloned();
                return Ok(AppendOutcome::Duplicate(existing));
            }
            SequenceCheck::OutOfOrder { last } => {
                return Err(CoachError::OutOfOrder {
                    sequence: observation.sequence,
                    last,
                });
            }
            SequenceCheck::Fresh => {}
        }

        let key = store::observation_key(session_id, observation.sequence);
        store::save_json(self.kv.as_ref(), &key, &observation).await?;
        let mut accepted = partition.accepted.clone();
        accepted.insert(observation.sequence);
        store::save_json(
            self.kv.as_ref(),
            &store::accepted_sequences_key(session_id),
            &accepted,
        )
        .await?;
        partition.accepted = accepted;
        let observation = Arc::new(observation);
        partition.log.push_back(Arc::clone(&observation));

        while partition.log.len() > self.capacity {
            if let Some(evicted) = partition.log.pop_front() {
                self.kv
                    .delete(&store::observation_key(session_id, evicted.sequence))
                    .await?;
                debug!(session_id, sequence = evicted.sequence, "Evicted observation");
            }
        }

        Ok(AppendOutcome::Appended(observation))
    }

    /// 最近 n 条，按到达顺序
    pub async fn rolling_window(
        &self,
        session_id: &str,
        n: usize,
    ) -> Result<Vec<Arc<Observation>>, StoreError> {
        let handle = self.partition(session_id).await;
        let mut partition = handle.lock().await;
        self.ensure_loaded(session_id, &mut partition).await?;
        Ok(partition.window(n))
    }

    pub async fn latest(&self, session_id: &str) -> Result<Option<Arc<Observation>>, StoreError> {
        Ok(self.rolling_window(session_id, 1).await?.pop())
    }

    /// 只读快照：不加载也不缓存分区（resume 使用）
    pub async fn snapshot_window(
        &self,
        session_id: &str,
        n: usize,
    ) -> Result<Vec<Observation>, StoreError> {
        let cached = self.partitions.lock().await.get(session_id).cloned();
        if let Some(handle) = cached {
            let partition = handle.lock().await;
            if partition.loaded {
                return Ok(partition.window(n).iter().map(|o| (**o).clone()).collect());
            }
        }
        let mut log = self.read_log(session_id).await?;
        let skip = log.len().saturating_sub(n);
        Ok(log.split_off(skip))
    }

    /// 释放内存分区（会话归档时），KV 中的日志保留可读
    pub async fn release(&self, session_id: &str) {
        self.partitions.lock().await.remove(session_id);
    }

    pub async fn cached_partitions(&self) -> usize {
        self.partitions.lock().await.len()
    }
}
