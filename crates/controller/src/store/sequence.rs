/// 序列号分配器
///
/// 计数器持久化在状态存储中，每次分配都通过 CAS 推进，并发分配不会得到重复值

use common::models::Sequence;
use common::{keys, Error, Result};
use tracing::debug;

use super::StateStore;

const MAX_ALLOCATE_ATTEMPTS: usize = 16;

impl StateStore {
    /// 显式创建计数器，已存在时保持原样
    pub async fn ensure_sequence(&self, name: &str, start: u64, step: u64) -> Result<()> {
        match self.create(&keys::sequence(name), &Sequence::new(name, start, step)).await {
            Ok(_) | Err(Error::UpdateConflict(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// 分配下一个序列值，计数器不存在时以 start=1, step=1 创建
    pub async fn next_sequence(&self, name: &str) -> Result<u64> {
        let key = keys::sequence(name);

        for attempt in 1..=MAX_ALLOCATE_ATTEMPTS {
            let (mut seq, revision) = match self.find::<Sequence>(&key).await? {
                Some(current) => (current.value, current.revision),
                None => (Sequence::new(name, 1, 1), 0),
            };

            let value = seq.next;
            seq.next = seq.next.checked_add(seq.step.max(1)).ok_or_else(|| {
                Error::ResourceExhausted(format!("序列 {} 已用尽", name))
            })?;

            match self.put_cas(&key, revision, &seq).await {
                Ok(_) => return Ok(value),
                Err(Error::UpdateConflict(_)) => {
                    debug!("序列 {} 分配冲突，第 {} 次重试", name, attempt);
                }
                Err(e) => return Err(e),
            }
        }

        Err(Error::UpdateConflict(format!("序列 {} 分配冲突次数过多", name)))
    }
}
