//! 调度器与传输层之间共享的报文类型。
//! 传输本身（请求响应 + 双向流）由外部协作方实现，这里只定义数据结构，
//! 双向流在进程内用一对 mpsc channel 建模。

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// 报文状态码
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Code {
    Success,

    /// 客户端还在等分片就绪，不需要调度动作
    ClientWaitPieceReady,

    /// 分片来源 peer 上已经没有这个任务了
    PeerTaskNotFound,

    /// 种子节点上没有这个任务
    SeedTaskNotFound,

    /// 种子节点内部错误
    SeedError,

    /// 种子节点下载失败
    SeedTaskDownloadFail,

    /// 调度器要求 peer 回源下载
    SchedNeedBackSource,

    /// 调度彻底失败，peer 无路可走
    SchedTaskStatusError,
}

/// 主机分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum HostType {
    #[default]
    Client,
    SuperSeed,
    StrongSeed,
    WeakSeed,
}

impl HostType {
    pub fn is_seed(&self) -> bool {
        !matches!(self, HostType::Client)
    }
}

/// 上游 peer 的寻址信息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestPeer {
    pub ip: String,
    pub rpc_port: u16,
    pub peer_id: String,
}

/// 推送给 peer 的调度包
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerPacket {
    pub task_id: String,
    pub src_pid: String,
    pub parallel_count: u32,
    pub main_peer: Option<DestPeer>,
    pub steal_peers: Vec<DestPeer>,
    pub code: Code,
}

impl PeerPacket {
    /// 只带状态码的控制包
    pub fn with_code(task_id: &str, src_pid: &str, code: Code) -> Self {
        Self {
            task_id: task_id.to_string(),
            src_pid: src_pid.to_string(),
            parallel_count: 0,
            main_peer: None,
            steal_peers: Vec::new(),
            code,
        }
    }
}

/// 分片元信息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PieceInfo {
    pub piece_num: u32,
    pub range_start: u64,
    pub range_size: u32,
    pub piece_digest: String,
    pub piece_offset: u64,
}

/// peer 上报的单个分片结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PieceResult {
    pub task_id: String,

    /// 上报者
    pub src_pid: String,

    /// 分片来源
    pub dst_pid: String,

    pub piece_info: Option<PieceInfo>,

    /// 开始、结束时间戳（毫秒）
    pub begin_time: u64,
    pub end_time: u64,

    pub success: bool,
    pub code: Code,

    /// 上报者已完成的分片数
    pub finished_count: i32,
}

/// peer 上报的整体下载结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerResult {
    pub task_id: String,
    pub peer_id: String,
    pub success: bool,
    pub total_piece_count: i32,
    pub content_length: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerTarget {
    pub task_id: String,
    pub peer_id: String,
}

/// 注册请求携带的 url 元信息，参与 task id 推导
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UrlMeta {
    /// 内容摘要，优先于 tag 参与 id 推导
    pub digest: String,

    /// 业务标记
    pub tag: String,

    /// Range 请求范围
    pub range: String,

    /// 要从 url 上剔除的 query 参数，& 分隔
    pub filter: String,
}

/// 主机注册信息
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostInfo {
    pub id: String,
    pub ip: String,
    pub rpc_port: u16,
    pub download_port: u16,
    pub host_type: HostType,
    pub idc: String,
    pub location: String,
    pub net_topology: String,
    pub security_domain: String,

    /// 并发上传上限，不传则按主机分类取默认值
    pub upload_limit: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub url: String,
    pub url_meta: UrlMeta,
    pub peer_id: String,
    pub peer_host: HostInfo,
}

/// 按内容大小划分的注册档位
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SizeScope {
    /// 内容直接塞进注册响应
    Tiny,

    /// 单分片，直接告知种子节点地址
    Small,

    /// 正常走分片上报流
    Normal,
}

/// small 档位的单分片引用
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinglePiece {
    pub dst_pid: String,
    pub dst_addr: String,
    pub piece_info: PieceInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResult {
    pub task_id: String,
    pub size_scope: SizeScope,

    /// tiny 档位的文件内容
    pub direct_piece: Option<Bytes>,

    /// small 档位的分片引用
    pub single_piece: Option<SinglePiece>,
}

/// 上报流的服务端视角：收分片结果，推调度包
pub type PieceResultReceiver = mpsc::Receiver<PieceResult>;
pub type PeerPacketSender = mpsc::Sender<PeerPacket>;
