//! WGSL compute shader sources for the GPU relaxation device.
//!
//! All vectors are f32 on the device. Block layouts match the host: row-major
//! `b × b` diagonal blocks and interleaved components (`x[row * b + k]`).

/// Threads per workgroup of every entry point; `gpu::WORKGROUP_SIZE` mirrors it.
pub const SHADER_WORKGROUP_SIZE: u32 = 256;

/// WGSL source containing all GPU compute kernels.
///
/// Entry points:
/// - `spmv_offdiag`: y = E * x, scalar MSR extra-diagonal applied per component
/// - `jacobi_scalar`: fused scalar Jacobi update + per-workgroup residual partial
/// - `jacobi_block3`: fused 3x3 block Jacobi, unrolled substitution
/// - `jacobi_block_n`: fused block Jacobi, block size up to 9
/// - `reduce_partials`: single-workgroup sum of the residual partials
pub const SHADER_SOURCE: &str = r#"
// ============================================================
// Relaxor GPU Compute Shaders
// ============================================================

const WG_SIZE: u32 = 256u;

struct KernelParams {
    n_rows: u32,
    db_size: u32,
    n_blocks: u32,
    _pad: u32,
}

var<workgroup> red_scratch: array<f32, 256>;

// Tree reduction of red_scratch into red_scratch[0]. Every invocation of the
// workgroup must call this. The last six steps are unrolled; WGSL gives no
// lockstep guarantee inside a subgroup, so each keeps its barrier.
fn reduce_scratch(lid: u32) {
    var stride = WG_SIZE / 2u;
    while stride > 32u {
        if lid < stride {
            red_scratch[lid] = red_scratch[lid] + red_scratch[lid + stride];
        }
        workgroupBarrier();
        stride = stride / 2u;
    }
    if lid < 32u {
        red_scratch[lid] = red_scratch[lid] + red_scratch[lid + 32u];
    }
    workgroupBarrier();
    if lid < 16u {
        red_scratch[lid] = red_scratch[lid] + red_scratch[lid + 16u];
    }
    workgroupBarrier();
    if lid < 8u {
        red_scratch[lid] = red_scratch[lid] + red_scratch[lid + 8u];
    }
    workgroupBarrier();
    if lid < 4u {
        red_scratch[lid] = red_scratch[lid] + red_scratch[lid + 4u];
    }
    workgroupBarrier();
    if lid < 2u {
        red_scratch[lid] = red_scratch[lid] + red_scratch[lid + 2u];
    }
    workgroupBarrier();
    if lid < 1u {
        red_scratch[lid] = red_scratch[lid] + red_scratch[lid + 1u];
    }
    workgroupBarrier();
}

// --- Off-diagonal SpMV ---
// One thread per block row, one pass per component.

@group(0) @binding(0) var<storage, read> op_values: array<f32>;
@group(0) @binding(1) var<storage, read> op_col_indices: array<u32>;
@group(0) @binding(2) var<storage, read> op_row_pointers: array<u32>;
@group(0) @binding(3) var<storage, read> op_x: array<f32>;
@group(0) @binding(4) var<storage, read_write> op_y: array<f32>;
@group(0) @binding(5) var<uniform> op_params: KernelParams;

@compute @workgroup_size(256)
fn spmv_offdiag(@builtin(global_invocation_id) gid: vec3<u32>) {
    let row = gid.x;
    if row >= op_params.n_rows {
        return;
    }
    let n = op_params.db_size;
    let row_start = op_row_pointers[row];
    let row_end = op_row_pointers[row + 1u];
    for (var k = 0u; k < n; k = k + 1u) {
        var sum: f32 = 0.0;
        for (var idx = row_start; idx < row_end; idx = idx + 1u) {
            sum = sum + op_values[idx] * op_x[op_col_indices[idx] * n + k];
        }
        op_y[row * n + k] = sum;
    }
}

// --- Fused relaxation ---
// vx holds the off-diagonal product on entry and the new iterate on exit.
// Rows past n_rows contribute zero; no thread returns before the barriers.

@group(0) @binding(0) var<storage, read> rel_ad: array<f32>;
@group(0) @binding(1) var<storage, read> rel_ad_inv: array<f32>;
@group(0) @binding(2) var<storage, read> rel_rhs: array<f32>;
@group(0) @binding(3) var<storage, read_write> rel_vx: array<f32>;
@group(0) @binding(4) var<storage, read_write> rel_rk: array<f32>;
@group(0) @binding(5) var<storage, read_write> rel_partials: array<f32>;
@group(0) @binding(6) var<uniform> rel_params: KernelParams;

fn store_partial(lid: u32, wid: u32, r2: f32) {
    red_scratch[lid] = r2;
    workgroupBarrier();
    reduce_scratch(lid);
    if lid == 0u {
        rel_partials[wid] = red_scratch[0];
    }
}

@compute @workgroup_size(256)
fn jacobi_scalar(
    @builtin(global_invocation_id) gid: vec3<u32>,
    @builtin(local_invocation_id) lid: vec3<u32>,
    @builtin(workgroup_id) wid: vec3<u32>,
) {
    let i = gid.x;
    var r2: f32 = 0.0;
    if i < rel_params.n_rows {
        let v = (rel_rhs[i] - rel_vx[i]) * rel_ad_inv[i];
        let r = rel_ad[i] * (v - rel_rk[i]);
        rel_vx[i] = v;
        rel_rk[i] = v;
        r2 = r * r;
    }
    store_partial(lid.x, wid.x, r2);
}

@compute @workgroup_size(256)
fn jacobi_block3(
    @builtin(global_invocation_id) gid: vec3<u32>,
    @builtin(local_invocation_id) lid: vec3<u32>,
    @builtin(workgroup_id) wid: vec3<u32>,
) {
    let i = gid.x;
    var r2: f32 = 0.0;
    if i < rel_params.n_rows {
        let m = i * 9u;
        let o = i * 3u;

        let aux0 = rel_rhs[o] - rel_vx[o];
        let aux1 = (rel_rhs[o + 1u] - rel_vx[o + 1u]) - aux0 * rel_ad_inv[m + 3u];
        let aux2 = (rel_rhs[o + 2u] - rel_vx[o + 2u]) - aux0 * rel_ad_inv[m + 6u] - aux1 * rel_ad_inv[m + 7u];

        let x2 = aux2 / rel_ad_inv[m + 8u];
        let x1 = (aux1 - rel_ad_inv[m + 5u] * x2) / rel_ad_inv[m + 4u];
        let x0 = (aux0 - rel_ad_inv[m + 1u] * x1 - rel_ad_inv[m + 2u] * x2) / rel_ad_inv[m];

        let d0 = x0 - rel_rk[o];
        let d1 = x1 - rel_rk[o + 1u];
        let d2 = x2 - rel_rk[o + 2u];
        for (var j = 0u; j < 3u; j = j + 1u) {
            let r = rel_ad[m + j * 3u] * d0 + rel_ad[m + j * 3u + 1u] * d1 + rel_ad[m + j * 3u + 2u] * d2;
            r2 = r2 + r * r;
        }

        rel_vx[o] = x0;
        rel_vx[o + 1u] = x1;
        rel_vx[o + 2u] = x2;
        rel_rk[o] = x0;
        rel_rk[o + 1u] = x1;
        rel_rk[o + 2u] = x2;
    }
    store_partial(lid.x, wid.x, r2);
}

@compute @workgroup_size(256)
fn jacobi_block_n(
    @builtin(global_invocation_id) gid: vec3<u32>,
    @builtin(local_invocation_id) lid: vec3<u32>,
    @builtin(workgroup_id) wid: vec3<u32>,
) {
    let i = gid.x;
    let n = rel_params.db_size;
    var r2: f32 = 0.0;
    if i < rel_params.n_rows {
        let m = i * n * n;
        let o = i * n;
        var aux: array<f32, 9>;
        var x: array<f32, 9>;

        // Forward substitution, unit lower factor.
        for (var j = 0u; j < n; j = j + 1u) {
            var s = rel_rhs[o + j] - rel_vx[o + j];
            for (var k = 0u; k < j; k = k + 1u) {
                s = s - aux[k] * rel_ad_inv[m + j * n + k];
            }
            aux[j] = s;
        }
        // Backward substitution, upper factor.
        for (var jj = 0u; jj < n; jj = jj + 1u) {
            let j = n - 1u - jj;
            var s = aux[j];
            for (var k = j + 1u; k < n; k = k + 1u) {
                s = s - x[k] * rel_ad_inv[m + j * n + k];
            }
            x[j] = s / rel_ad_inv[m + j * (n + 1u)];
        }

        for (var j = 0u; j < n; j = j + 1u) {
            var r: f32 = 0.0;
            for (var k = 0u; k < n; k = k + 1u) {
                r = r + rel_ad[m + j * n + k] * (x[k] - rel_rk[o + k]);
            }
            r2 = r2 + r * r;
        }
        for (var j = 0u; j < n; j = j + 1u) {
            rel_vx[o + j] = x[j];
            rel_rk[o + j] = x[j];
        }
    }
    store_partial(lid.x, wid.x, r2);
}

// --- Second-level reduction ---
// One workgroup: grid-stride accumulation, then the shared tree.

@group(0) @binding(0) var<storage, read> red_partials: array<f32>;
@group(0) @binding(1) var<storage, read_write> red_out: array<f32>;
@group(0) @binding(2) var<uniform> red_params: KernelParams;

@compute @workgroup_size(256)
fn reduce_partials(@builtin(local_invocation_id) lid: vec3<u32>) {
    var acc: f32 = 0.0;
    var i = lid.x;
    while i < red_params.n_blocks {
        acc = acc + red_partials[i];
        i = i + WG_SIZE;
    }
    red_scratch[lid.x] = acc;
    workgroupBarrier();
    reduce_scratch(lid.x);
    if lid.x == 0u {
        red_out[0] = red_scratch[0];
    }
}
"#;

#[cfg(test)]
mod tests {
    use super::*;

    /// Validate that the WGSL shader source parses without errors.
    /// Uses naga's WGSL frontend directly so this works without a GPU.
    #[test]
    fn wgsl_parses_successfully() {
        let result = naga::front::wgsl::parse_str(SHADER_SOURCE);
        match result {
            Ok(module) => {
                let entry_names: Vec<&str> =
                    module.entry_points.iter().map(|ep| ep.name.as_str()).collect();
                let expected = [
                    "spmv_offdiag",
                    "jacobi_scalar",
                    "jacobi_block3",
                    "jacobi_block_n",
                    "reduce_partials",
                ];
                for name in &expected {
                    assert!(
                        entry_names.contains(name),
                        "missing entry point: {name}. Found: {entry_names:?}"
                    );
                }
            }
            Err(e) => {
                let report = e.emit_to_string(SHADER_SOURCE);
                panic!("WGSL parse error:\n{report}");
            }
        }
    }

    /// Type and uniformity checks, which parsing alone does not run.
    #[test]
    fn wgsl_validates() {
        let module = match naga::front::wgsl::parse_str(SHADER_SOURCE) {
            Ok(module) => module,
            Err(e) => {
                let report = e.emit_to_string(SHADER_SOURCE);
                panic!("WGSL parse error:\n{report}");
            }
        };
        let mut validator = naga::valid::Validator::new(
            naga::valid::ValidationFlags::all(),
            naga::valid::Capabilities::default(),
        );
        if let Err(e) = validator.validate(&module) {
            let report = e.emit_to_string(SHADER_SOURCE);
            panic!("WGSL validation error:\n{report}");
        }
    }

    #[test]
    fn workgroup_size_matches_shader() {
        let constant = format!("const WG_SIZE: u32 = {SHADER_WORKGROUP_SIZE}u;");
        let scratch = format!("array<f32, {SHADER_WORKGROUP_SIZE}>");
        assert!(SHADER_SOURCE.contains(&constant));
        assert!(SHADER_SOURCE.contains(&scratch));
    }
}
