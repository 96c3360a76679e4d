//! Calling conventions and function signatures.
//!
//! A calling convention maps the parameters and the return value of a signature to *storages*: a
//! register read (parameters) or written (return value), possibly at an offset from it (stack
//! parameters are read relative to the stack pointer).

use crate::pcode::{Register, RegisterId};
use itertools::Itertools;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub enum UseType {
    Read,
    Write,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct Storage {
    pub use_type: UseType,
    pub register_id: RegisterId,
    pub offset: u64,
}

impl Storage {
    pub fn register(use_type: UseType, register_id: RegisterId) -> Self {
        Self {
            use_type,
            register_id,
            offset: 0,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub enum StorageKind {
    Parameter,
    Return,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct StorageInfo {
    pub kind: StorageKind,
    /// Index of the parameter (0-based), `0` for the return value
    pub param_idx: usize,
    pub is_float: bool,
}

/// A scalar type, as much as the researchers can tell about a parameter or return value.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct ScalarType {
    pub size: usize,
    pub is_float: bool,
}

impl ScalarType {
    pub fn int(size: usize) -> Self {
        Self {
            size,
            is_float: false,
        }
    }

    pub fn float(size: usize) -> Self {
        Self {
            size,
            is_float: true,
        }
    }
}

impl std::fmt::Display for ScalarType {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match (self.is_float, self.size) {
            (true, 4) => write!(f, "float"),
            (true, 8) => write!(f, "double"),
            (true, n) => write!(f, "float{}", n * 8),
            (false, 1) | (false, 2) | (false, 4) | (false, 8) => {
                write!(f, "uint{}_t", self.size * 8)
            }
            (false, n) => write!(f, "unk{}", n * 8),
        }
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Parameter {
    pub name: String,
    pub ty: ScalarType,
}

pub trait CallingConvention: std::fmt::Debug {
    fn name(&self) -> &'static str;

    /// The storages of the parameters and the return value (`None` for void).
    fn storages(
        &self,
        parameters: &[Parameter],
        return_type: Option<ScalarType>,
    ) -> Vec<(Storage, StorageInfo)>;

    /// What a storage would hold in any signature of this convention, if anything.
    fn storage_info(&self, storage: &Storage) -> Option<StorageInfo>;
}

/// The Microsoft x64 convention.
#[derive(Clone, Copy, Debug, Default)]
pub struct FastcallCallingConvention;

impl FastcallCallingConvention {
    /// Integer and float register of each of the first four parameters
    const PARAM_REGISTERS: [(&'static str, &'static str); 4] = [
        ("rcx", "xmm0"),
        ("rdx", "xmm1"),
        ("r8", "xmm2"),
        ("r9", "xmm3"),
    ];
    /// Offset of the first stack parameter from the stack pointer at function entry (return
    /// address plus the home space of the register parameters)
    pub const STACK_PARAMS_OFFSET: u64 = 0x28;

    fn register_id(name: &str) -> RegisterId {
        Register::by_name(name)
            .map(|r| r.id)
            .unwrap_or_else(|| unreachable!("register {} is missing from the table", name))
    }
}

impl CallingConvention for FastcallCallingConvention {
    fn name(&self) -> &'static str {
        "fastcall"
    }

    fn storages(
        &self,
        parameters: &[Parameter],
        return_type: Option<ScalarType>,
    ) -> Vec<(Storage, StorageInfo)> {
        let mut res = vec![];
        for (i, param) in parameters.iter().enumerate() {
            let info = StorageInfo {
                kind: StorageKind::Parameter,
                param_idx: i,
                is_float: param.ty.is_float,
            };
            let storage = match Self::PARAM_REGISTERS.get(i) {
                Some((int_reg, float_reg)) => Storage::register(
                    UseType::Read,
                    Self::register_id(if param.ty.is_float { float_reg } else { int_reg }),
                ),
                None => Storage {
                    use_type: UseType::Read,
                    register_id: Register::STACK_POINTER_ID,
                    offset: Self::STACK_PARAMS_OFFSET + 8 * (i - Self::PARAM_REGISTERS.len()) as u64,
                },
            };
            res.push((storage, info));
        }
        if let Some(ret) = return_type {
            let reg = if ret.is_float { "xmm0" } else { "rax" };
            res.push((
                Storage::register(UseType::Write, Self::register_id(reg)),
                StorageInfo {
                    kind: StorageKind::Return,
                    param_idx: 0,
                    is_float: ret.is_float,
                },
            ));
        }
        res
    }

    fn storage_info(&self, storage: &Storage) -> Option<StorageInfo> {
        match storage.use_type {
            UseType::Read => {
                if storage.register_id == Register::STACK_POINTER_ID {
                    if storage.offset < Self::STACK_PARAMS_OFFSET || storage.offset % 8 != 0 {
                        return None;
                    }
                    return Some(StorageInfo {
                        kind: StorageKind::Parameter,
                        param_idx: Self::PARAM_REGISTERS.len()
                            + ((storage.offset - Self::STACK_PARAMS_OFFSET) / 8) as usize,
                        is_float: false,
                    });
                }
                if storage.offset != 0 {
                    return None;
                }
                Self::PARAM_REGISTERS
                    .iter()
                    .enumerate()
                    .find_map(|(idx, (int_reg, float_reg))| {
                        if Self::register_id(int_reg) == storage.register_id {
                            Some((idx, false))
                        } else if Self::register_id(float_reg) == storage.register_id {
                            Some((idx, true))
                        } else {
                            None
                        }
                    })
                    .map(|(param_idx, is_float)| StorageInfo {
                        kind: StorageKind::Parameter,
                        param_idx,
                        is_float,
                    })
            }
            UseType::Write => {
                let is_float = if storage.register_id == Self::register_id("rax") {
                    false
                } else if storage.register_id == Self::register_id("xmm0") {
                    true
                } else {
                    return None;
                };
                (storage.offset == 0).then(|| StorageInfo {
                    kind: StorageKind::Return,
                    param_idx: 0,
                    is_float,
                })
            }
        }
    }
}

/// The signature of a function, along with the storages its calling convention assigns.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct FunctionSignature {
    pub convention: &'static str,
    pub parameters: Vec<Parameter>,
    pub return_type: Option<ScalarType>,
    pub storages: Vec<(Storage, StorageInfo)>,
}

impl FunctionSignature {
    pub fn new(
        convention: &dyn CallingConvention,
        parameters: Vec<Parameter>,
        return_type: Option<ScalarType>,
    ) -> Self {
        let storages = convention.storages(&parameters, return_type);
        Self {
            convention: convention.name(),
            parameters,
            return_type,
            storages,
        }
    }

    /// `void ()`
    pub fn empty(convention: &dyn CallingConvention) -> Self {
        Self::new(convention, vec![], None)
    }

    pub fn return_size(&self) -> usize {
        self.return_type.map_or(0, |t| t.size)
    }

    pub fn find_storage_info(&self, storage: &Storage) -> Option<&StorageInfo> {
        self.storages
            .iter()
            .find(|(s, _)| s == storage)
            .map(|(_, info)| info)
    }

    pub fn parameter_storage(&self, param_idx: usize) -> Option<&Storage> {
        self.storages
            .iter()
            .find(|(_, info)| info.kind == StorageKind::Parameter && info.param_idx == param_idx)
            .map(|(s, _)| s)
    }

    pub fn return_storage(&self) -> Option<&Storage> {
        self.storages
            .iter()
            .find(|(_, info)| info.kind == StorageKind::Return)
            .map(|(s, _)| s)
    }
}

impl std::fmt::Display for FunctionSignature {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let ret = match &self.return_type {
            Some(t) => t.to_string(),
            None => "void".to_string(),
        };
        write!(
            f,
            "signature {} {} ({})",
            self.convention,
            ret,
            self.parameters
                .iter()
                .map(|p| format!("{} {}", p.ty, p.name))
                .join(", ")
        )
    }
}
