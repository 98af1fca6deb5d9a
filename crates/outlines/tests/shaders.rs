//! Every embedded program must parse and validate as WGSL

use outlines::{PROGRAMS, shader_source};

fn validate(path: &str) -> naga::Module {
    let source = shader_source(path).unwrap();
    let module = naga::front::wgsl::parse_str(source).unwrap_or_else(|error| panic!("{path}: {}", error.emit_to_string(source)));
    naga::valid::Validator::new(naga::valid::ValidationFlags::all(), naga::valid::Capabilities::all())
        .validate(&module)
        .unwrap_or_else(|error| panic!("{path}: {error:?}"));
    module
}

#[test]
fn test_programs_validate() {
    for path in PROGRAMS {
        validate(path);
    }
}

#[test]
fn test_programs_fit_default_bind_group_limit() {
    for path in PROGRAMS {
        let module = validate(path);
        for (_, variable) in module.global_variables.iter() {
            if let Some(binding) = &variable.binding {
                assert!(binding.group < 4, "{path}: group {} exceeds the default limit", binding.group);
                assert_eq!(binding.binding, 0, "{path}: one resource per group");
            }
        }
    }
}

#[test]
fn test_programs_use_8x8_workgroups() {
    for path in PROGRAMS {
        let module = validate(path);
        let entry = module.entry_points.iter().find(|entry| entry.name == "main").unwrap();
        assert_eq!(entry.stage, naga::ShaderStage::Compute);
        assert_eq!(entry.workgroup_size, [8, 8, 1], "{path}");
    }
}
