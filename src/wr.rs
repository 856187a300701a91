//! Work requests and work completions as submitted and polled by the
//! verbs consumer.

/// One element of a scatter/gather list.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Sge {
    pub addr: u64,
    pub length: u32,
    pub lkey: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WrOpcode {
    Send,
    SendWithImm,
    RdmaWrite,
    RdmaWriteWithImm,
    RdmaRead,
    CompSwap,
    FetchAdd,
}

impl WrOpcode {
    pub(crate) fn is_rd_atomic(self) -> bool {
        matches!(self, WrOpcode::RdmaRead | WrOpcode::CompSwap | WrOpcode::FetchAdd)
    }

    pub(crate) fn is_atomic(self) -> bool {
        matches!(self, WrOpcode::CompSwap | WrOpcode::FetchAdd)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SendFlags {
    pub signaled: bool,
    pub solicited: bool,
    pub fence: bool,
    /// Payload is captured at post time instead of being read from
    /// registered memory at send time.
    pub inline: bool,
}

/// Destination of a UD work request.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct UdDest {
    pub dlid: u16,
    pub dqpn: u32,
    pub qkey: u32,
}

/// A send-side work request. Immutable once submitted.
#[derive(Debug, Clone)]
pub struct SendWr {
    pub wr_id: u64,
    pub opcode: WrOpcode,
    pub sg_list: Vec<Sge>,
    pub flags: SendFlags,
    /// Captured payload when `flags.inline` is set.
    pub inline_data: Vec<u8>,
    pub remote_addr: u64,
    pub rkey: u32,
    pub imm: Option<u32>,
    pub compare: u64,
    pub swap_add: u64,
    pub ud: Option<UdDest>,
}

impl SendWr {
    pub fn send(wr_id: u64, sg_list: Vec<Sge>) -> Self {
        Self::new(wr_id, WrOpcode::Send, sg_list)
    }

    pub fn send_with_imm(wr_id: u64, sg_list: Vec<Sge>, imm: u32) -> Self {
        let mut wr = Self::new(wr_id, WrOpcode::SendWithImm, sg_list);
        wr.imm = Some(imm);
        wr
    }

    pub fn rdma_write(wr_id: u64, sg_list: Vec<Sge>, remote_addr: u64, rkey: u32) -> Self {
        let mut wr = Self::new(wr_id, WrOpcode::RdmaWrite, sg_list);
        wr.remote_addr = remote_addr;
        wr.rkey = rkey;
        wr
    }

    pub fn rdma_read(wr_id: u64, sg_list: Vec<Sge>, remote_addr: u64, rkey: u32) -> Self {
        let mut wr = Self::new(wr_id, WrOpcode::RdmaRead, sg_list);
        wr.remote_addr = remote_addr;
        wr.rkey = rkey;
        wr
    }

    pub fn compare_swap(
        wr_id: u64,
        result_sge: Sge,
        remote_addr: u64,
        rkey: u32,
        compare: u64,
        swap: u64,
    ) -> Self {
        let mut wr = Self::new(wr_id, WrOpcode::CompSwap, vec![result_sge]);
        wr.remote_addr = remote_addr;
        wr.rkey = rkey;
        wr.compare = compare;
        wr.swap_add = swap;
        wr
    }

    pub fn fetch_add(wr_id: u64, result_sge: Sge, remote_addr: u64, rkey: u32, add: u64) -> Self {
        let mut wr = Self::new(wr_id, WrOpcode::FetchAdd, vec![result_sge]);
        wr.remote_addr = remote_addr;
        wr.rkey = rkey;
        wr.swap_add = add;
        wr
    }

    fn new(wr_id: u64, opcode: WrOpcode, sg_list: Vec<Sge>) -> Self {
        Self {
            wr_id,
            opcode,
            sg_list,
            flags: SendFlags {
                signaled: true,
                ..SendFlags::default()
            },
            inline_data: Vec::new(),
            remote_addr: 0,
            rkey: 0,
            imm: None,
            compare: 0,
            swap_add: 0,
            ud: None,
        }
    }

    pub fn with_flags(mut self, flags: SendFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_ud_dest(mut self, dest: UdDest) -> Self {
        self.ud = Some(dest);
        self
    }

    pub fn with_inline_data(mut self, data: Vec<u8>) -> Self {
        self.flags.inline = true;
        self.inline_data = data;
        self
    }

    /// Total byte length the request moves.
    pub(crate) fn total_length(&self) -> u32 {
        if self.flags.inline {
            self.inline_data.len() as u32
        } else {
            self.sg_list.iter().map(|sge| sge.length).sum()
        }
    }
}

/// A receive-side work request.
#[derive(Debug, Clone)]
pub struct RecvWr {
    pub wr_id: u64,
    pub sg_list: Vec<Sge>,
}

impl RecvWr {
    pub fn new(wr_id: u64, sg_list: Vec<Sge>) -> Self {
        Self { wr_id, sg_list }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum WcStatus {
    #[default]
    Success,
    LocLenErr,
    LocProtErr,
    LocQpOpErr,
    WrFlushErr,
    RemInvReqErr,
    RemAccessErr,
    RemOpErr,
    RetryExcErr,
    RnrRetryExcErr,
    FatalErr,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum WcOpcode {
    #[default]
    Send,
    RdmaWrite,
    RdmaRead,
    CompSwap,
    FetchAdd,
    Recv,
    RecvRdmaWithImm,
}

impl WcOpcode {
    pub(crate) fn from_wr(opcode: WrOpcode) -> Self {
        match opcode {
            WrOpcode::Send | WrOpcode::SendWithImm => WcOpcode::Send,
            WrOpcode::RdmaWrite | WrOpcode::RdmaWriteWithImm => WcOpcode::RdmaWrite,
            WrOpcode::RdmaRead => WcOpcode::RdmaRead,
            WrOpcode::CompSwap => WcOpcode::CompSwap,
            WrOpcode::FetchAdd => WcOpcode::FetchAdd,
        }
    }
}

/// A polled completion.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WorkCompletion {
    pub wr_id: u64,
    pub status: WcStatus,
    pub opcode: WcOpcode,
    pub byte_len: u32,
    pub imm: Option<u32>,
    pub qp_num: u32,
    pub src_qp: u32,
    pub slid: u16,
    pub sl: u8,
    pub pkey_index: u16,
    pub dlid_path_bits: u8,
    pub port_num: u8,
}
