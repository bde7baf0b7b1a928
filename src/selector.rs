use std::sync::atomic::{AtomicUsize, Ordering};

use thiserror::Error;

use crate::matcher::SelectionStrategy;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SelectError {
    #[error("no DoH url select method: {0:?}")]
    UnknownStrategy(String),
    #[error("upstream pool is empty")]
    EmptyPool,
}

/// 从上游池中选出下一个 URL。
///
/// 全进程共享一个实例。轮询游标通过一次原子的「读取-归一化-前进」取得，
/// 并发调用不会跳过或重复：对大小为 N 的池连续 N 次调用，每个 URL 恰好出现一次。
#[derive(Debug, Default)]
pub struct UpstreamSelector {
    cursor: AtomicUsize,
}

impl UpstreamSelector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn select<'a>(
        &self,
        strategy: &SelectionStrategy,
        pool: &'a [String],
    ) -> Result<&'a str, SelectError> {
        if let SelectionStrategy::Unknown(name) = strategy {
            return Err(SelectError::UnknownStrategy(name.clone()));
        }
        if pool.is_empty() {
            return Err(SelectError::EmptyPool);
        }
        let idx = match strategy {
            SelectionStrategy::Random => fastrand::usize(..pool.len()),
            _ => self.next_index(pool.len()),
        };
        Ok(&pool[idx])
    }

    // 游标超出当前池（更大的池或热更新前遗留）时先归零
    fn next_index(&self, len: usize) -> usize {
        let normalize = |c: usize| if c >= len { 0 } else { c };
        let prev = match self
            .cursor
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| {
                Some((normalize(c) + 1) % len)
            }) {
            Ok(prev) | Err(prev) => prev,
        };
        normalize(prev)
    }

    #[cfg(test)]
    fn cursor(&self) -> usize {
        self.cursor.load(Ordering::Acquire)
    }
}
