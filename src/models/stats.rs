use serde::Serialize;

#[derive(Debug, Clone, Serialize, Default, PartialEq)]
pub struct ProcessStats {
    /// CPU 使用率 (占整机算力的百分比，0-100)
    pub cpu_usage: f32,

    /// 常驻内存 (字节)
    pub memory_bytes: u64,

    /// 虚拟内存使用量 (字节)
    pub virtual_memory_bytes: u64,

    /// 累计 CPU 时间 (毫秒)
    pub cpu_time_ms: u64,

    /// 累计能耗估算 (焦耳)
    pub energy_joules: f64,
}

impl ProcessStats {
    /// 创建一个空的统计数据
    pub fn empty() -> Self {
        Self::default()
    }

    /// 判断是否有有效数据
    pub fn is_valid(&self) -> bool {
        self.cpu_usage > 0.0 || self.memory_bytes > 0
    }
}
