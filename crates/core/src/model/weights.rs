//! Weights artifacts: ONNX `ModelProto` files whose graph initializers carry
//! the parameter mapping.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Context;
use ndarray::{ArrayD, ArrayViewD, IxDyn};
use prost::Message;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::trace;

use crate::error::{ChdError, Result};

/// Generated ONNX protobuf types from `proto/onnx.proto3`.
mod onnx_proto {
    include!(concat!(env!("OUT_DIR"), "/onnx.rs"));
}

const ONNX_FLOAT: i32 = 1;
const ENCODED_IR_VERSION: i64 = 8;
const ENCODED_OPSET_VERSION: i64 = 17;
const PRODUCER_NAME: &str = "cardiocam";

/// Named float32 tensors read from (or destined for) a weights artifact.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterSet {
    tensors: BTreeMap<String, ArrayD<f32>>,
}

impl ParameterSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).map_err(|e| {
            ChdError::ModelLoad(format!(
                "failed to read weights artifact {}: {e}",
                path.display()
            ))
        })?;
        Self::from_bytes(&bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let model = onnx_proto::ModelProto::decode(bytes)
            .map_err(|e| ChdError::ModelLoad(format!("failed to decode ONNX protobuf: {e}")))?;
        let graph = model
            .graph
            .ok_or_else(|| ChdError::ModelLoad("ONNX model has no graph".to_string()))?;

        let mut tensors = BTreeMap::new();
        for initializer in &graph.initializer {
            // Integer initializers are graph constants (shapes, axes), not weights.
            if initializer.data_type != ONNX_FLOAT {
                trace!(
                    name = %initializer.name,
                    data_type = %data_type_name(initializer.data_type),
                    "Skipping non-float initializer"
                );
                continue;
            }
            let array = initializer_to_array(initializer)?;
            tensors.insert(initializer.name.clone(), array);
        }
        Ok(Self { tensors })
    }

    pub fn insert(&mut self, name: impl Into<String>, tensor: ArrayD<f32>) {
        self.tensors.insert(name.into(), tensor);
    }

    pub fn get(&self, name: &str) -> Option<&ArrayD<f32>> {
        self.tensors.get(name)
    }

    /// Look up `name` and check it has exactly `shape`.
    pub fn require(&self, name: &str, shape: &[usize]) -> Result<ArrayViewD<'_, f32>> {
        let tensor = self
            .tensors
            .get(name)
            .ok_or_else(|| ChdError::ModelLoad(format!("missing parameter '{name}'")))?;
        if tensor.shape() != shape {
            return Err(ChdError::ModelLoad(format!(
                "parameter '{name}' has shape {:?}, expected {:?}",
                tensor.shape(),
                shape
            )));
        }
        Ok(tensor.view())
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(String::as_str)
    }

    pub fn param_count(&self) -> usize {
        self.tensors.values().map(ArrayD::len).sum()
    }

    /// Encode as a graph-less-ops ONNX model: initializers only, stored as
    /// little-endian `raw_data`.
    pub fn encode_onnx(&self) -> Vec<u8> {
        let initializer = self
            .tensors
            .iter()
            .map(|(name, tensor)| onnx_proto::TensorProto {
                dims: tensor.shape().iter().map(|&d| d as i64).collect(),
                data_type: ONNX_FLOAT,
                float_data: Vec::new(),
                name: name.clone(),
                raw_data: tensor.iter().flat_map(|v| v.to_le_bytes()).collect(),
            })
            .collect();

        let model = onnx_proto::ModelProto {
            ir_version: ENCODED_IR_VERSION,
            producer_name: PRODUCER_NAME.to_string(),
            producer_version: env!("CARGO_PKG_VERSION").to_string(),
            graph: Some(onnx_proto::GraphProto {
                name: "parameters".to_string(),
                initializer,
                ..Default::default()
            }),
            opset_import: vec![onnx_proto::OperatorSetIdProto {
                domain: String::new(),
                version: ENCODED_OPSET_VERSION,
            }],
            ..Default::default()
        };
        model.encode_to_vec()
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory: {}", parent.display()))?;
        }
        std::fs::write(path, self.encode_onnx())
            .with_context(|| format!("failed to write weights artifact: {}", path.display()))
    }
}

fn initializer_to_array(tensor: &onnx_proto::TensorProto) -> Result<ArrayD<f32>> {
    let mut shape = Vec::with_capacity(tensor.dims.len());
    for &dim in &tensor.dims {
        let dim = usize::try_from(dim).map_err(|_| {
            ChdError::ModelLoad(format!(
                "initializer '{}' has negative dimension {dim}",
                tensor.name
            ))
        })?;
        shape.push(dim);
    }
    let expected: usize = shape.iter().product();

    let values: Vec<f32> = if !tensor.float_data.is_empty() {
        tensor.float_data.clone()
    } else if tensor.raw_data.len() == expected * 4 {
        tensor
            .raw_data
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect()
    } else {
        return Err(ChdError::ModelLoad(format!(
            "initializer '{}' carries {} raw bytes for {expected} elements",
            tensor.name,
            tensor.raw_data.len()
        )));
    };

    ArrayD::from_shape_vec(IxDyn(&shape), values).map_err(|e| {
        ChdError::ModelLoad(format!("initializer '{}' is malformed: {e}", tensor.name))
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct TensorInfo {
    pub name: String,
    /// Human-readable data type, e.g. "float32", "int64".
    pub data_type: String,
    /// Dimensions. `-1` represents a dynamic/symbolic dimension.
    pub shape: Vec<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelInspection {
    pub ir_version: i64,
    pub opset_version: i64,
    pub producer_name: String,
    pub producer_version: String,
    pub inputs: Vec<TensorInfo>,
    pub outputs: Vec<TensorInfo>,
    pub initializer_count: usize,
    /// Sum of all initializer tensor element counts.
    pub param_count: u64,
    pub op_count: usize,
    pub sha256: String,
}

impl ModelInspection {
    pub fn output(&self, name: &str) -> Option<&TensorInfo> {
        self.outputs.iter().find(|o| o.name == name)
    }
}

fn data_type_name(dt: i32) -> String {
    match dt {
        1 => "float32".into(),
        2 => "uint8".into(),
        3 => "int8".into(),
        6 => "int32".into(),
        7 => "int64".into(),
        9 => "bool".into(),
        10 => "float16".into(),
        11 => "float64".into(),
        16 => "bfloat16".into(),
        _ => format!("unknown({dt})"),
    }
}

fn value_info_to_tensor(vi: &onnx_proto::ValueInfoProto) -> TensorInfo {
    let (data_type, shape) = vi
        .r#type
        .as_ref()
        .and_then(|tp| tp.value.as_ref())
        .map(|val| match val {
            onnx_proto::type_proto::Value::TensorType(t) => {
                let dims = t
                    .shape
                    .as_ref()
                    .map(|s| {
                        s.dim
                            .iter()
                            .map(|d| match &d.value {
                                Some(
                                    onnx_proto::tensor_shape_proto::dimension::Value::DimValue(v),
                                ) => *v,
                                _ => -1,
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                (data_type_name(t.elem_type), dims)
            }
        })
        .unwrap_or_else(|| ("unknown".into(), vec![]));

    TensorInfo {
        name: vi.name.clone(),
        data_type,
        shape,
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Inspect a weights artifact without creating a runtime session.
pub fn inspect(path: &Path) -> anyhow::Result<ModelInspection> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("failed to read ONNX file: {}", path.display()))?;
    inspect_bytes(&bytes)
}

pub fn inspect_bytes(bytes: &[u8]) -> anyhow::Result<ModelInspection> {
    let model = onnx_proto::ModelProto::decode(bytes).context("failed to decode ONNX protobuf")?;

    let opset_version = model
        .opset_import
        .iter()
        .filter(|op| op.domain.is_empty())
        .map(|op| op.version)
        .max()
        .unwrap_or(0);

    let graph = model.graph.as_ref().context("ONNX model has no graph")?;

    let param_count = graph
        .initializer
        .iter()
        .map(|t| {
            if t.dims.is_empty() {
                1
            } else {
                t.dims.iter().map(|&d| d.max(0) as u64).product()
            }
        })
        .sum();

    Ok(ModelInspection {
        ir_version: model.ir_version,
        opset_version,
        producer_name: model.producer_name.clone(),
        producer_version: model.producer_version.clone(),
        inputs: graph.input.iter().map(value_info_to_tensor).collect(),
        outputs: graph.output.iter().map(value_info_to_tensor).collect(),
        initializer_count: graph.initializer.len(),
        param_count,
        op_count: graph.node.len(),
        sha256: sha256_hex(bytes),
    })
}
