/// Build flow:
///
/// 1. Without the `rdma-core` feature, nothing is linked: the crate only
///    carries the provider seam and the in-process fake fabric.
/// 2. With it, probe `libibverbs` and `librdmacm` via `pkg-config` and
///    generate bindings for both.
fn main() {
    // Refuse to compile on non-64-bit platforms.
    if cfg!(not(target_pointer_width = "64")) {
        panic!("`rrpma` currently only supports 64-bit platforms");
    }

    #[cfg(feature = "rdma-core")]
    rdma_core::link_and_generate();
}

#[cfg(feature = "rdma-core")]
mod rdma_core {
    use std::env;
    use std::path::Path;

    /// First `libibverbs` release (rdma-core v43) that ships `ibv_wr_flush`
    /// and `ibv_wr_atomic_write`.
    const NATIVE_FLUSH_VERSION: [u32; 3] = [1, 14, 43];

    fn parse_version(ver: &str) -> Vec<u32> {
        ver.split('.').filter_map(|p| p.parse().ok()).collect()
    }

    pub fn link_and_generate() {
        println!("cargo:rerun-if-changed=src/bindings/rdma.h");

        let verbs = pkg_config::Config::new()
            .atleast_version("1.8.28")
            .statik(false)
            .probe("libibverbs")
            .expect("cannot find libibverbs via pkg-config");
        let cm = pkg_config::Config::new()
            .statik(false)
            .probe("librdmacm")
            .expect("cannot find librdmacm via pkg-config");

        if parse_version(&verbs.version).as_slice() >= &NATIVE_FLUSH_VERSION[..] {
            println!("cargo:rustc-cfg=rdma_core_flush");
        }

        let include_args = verbs
            .include_paths
            .iter()
            .chain(cm.include_paths.iter())
            .map(|p| format!("-I{}", p.display()));

        let bindings = bindgen::builder()
            .clang_args(include_args)
            .header("src/bindings/rdma.h")
            .allowlist_function("ibv_.*")
            .allowlist_function("rdma_.*")
            .allowlist_type("ibv_.*")
            .allowlist_type("rdma_.*")
            .allowlist_type("verbs_.*")
            .allowlist_var("IBV_.*")
            .opaque_type("pthread_.*")
            .bitfield_enum("ibv_access_flags")
            .bitfield_enum("ibv_send_flags")
            .bitfield_enum("ibv_wc_flags")
            .bitfield_enum("ibv_odp_general_caps")
            .bitfield_enum("ibv_odp_transport_cap_bits")
            .bitfield_enum("ibv_qp_init_attr_mask")
            .bitfield_enum("ibv_qp_create_send_ops_flags")
            .constified_enum_module("ibv_wc_status")
            .constified_enum_module("ibv_wc_opcode")
            .constified_enum_module("ibv_wr_opcode")
            .constified_enum_module("ibv_qp_type")
            .constified_enum_module("ibv_transport_type")
            .constified_enum_module("rdma_cm_event_type")
            .constified_enum_module("rdma_port_space")
            .derive_copy(true)
            .derive_debug(false)
            .derive_default(true)
            .generate_comments(false)
            .layout_tests(false)
            .prepend_enum_name(false)
            .size_t_is_usize(true)
            .generate()
            .expect("failed to generate bindings");

        let out_dir = env::var_os("OUT_DIR").expect("OUT_DIR is not set");
        let dest = Path::new(&out_dir).join("rdma_bindings.rs");
        bindings
            .write_to_file(dest)
            .expect("failed to write bindings");
    }
}
