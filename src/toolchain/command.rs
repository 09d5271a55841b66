//! Compile command inspection and rewriting.

use std::path::Path;

/// Extensions recognized as C++ translation unit or module interface sources.
pub const SOURCE_EXTENSIONS: &[&str] = &["cpp", "cc", "cxx", "c++", "C", "cppm", "ixx", "mpp", "cxxm", "ccm"];

/// Flags that take their value as the next argument.
const FLAGS_WITH_VALUE: &[&str] = &[
    "-o", "-I", "-isystem", "-iquote", "-include", "-D", "-U", "-x", "-target", "-MF", "-MT", "-MQ",
];

fn is_source(arg: &str) -> bool {
    !arg.starts_with('-')
        && Path::new(arg)
            .extension()
            .and_then(|e| e.to_str())
            .map_or(false, |ext| SOURCE_EXTENSIONS.contains(&ext))
}

/// Index of the last source argument of `command`, skipping flag values.
fn source_index(command: &[String]) -> Option<usize> {
    let mut found = None;
    let mut skip_next = false;
    // Skip argv[0], the compiler itself.
    for (i, arg) in command.iter().enumerate().skip(1) {
        if skip_next {
            skip_next = false;
            continue;
        }
        if FLAGS_WITH_VALUE.contains(&arg.as_str()) {
            skip_next = true;
            continue;
        }
        if is_source(arg) {
            found = Some(i);
        }
    }
    found
}

/// The source file a compile command compiles.
pub fn source_file(command: &[String]) -> Option<&str> {
    source_index(command).map(|i| command[i].as_str())
}

/// Flags that make two compilations' module artifacts incompatible:
/// language standard, macro definitions, target, optimization and
/// feature (`-f`, `-m`) flags. Order is preserved.
pub fn context_flags(command: &[String]) -> Vec<String> {
    let mut out = Vec::new();
    let mut iter = command.iter().skip(1);
    while let Some(arg) = iter.next() {
        let a = arg.as_str();
        if matches!(a, "-D" | "-U" | "-target") {
            if let Some(value) = iter.next() {
                out.push(format!("{a}{value}"));
            }
            continue;
        }
        if FLAGS_WITH_VALUE.contains(&a) {
            iter.next();
            continue;
        }
        let relevant = a.starts_with("-std=")
            || a.starts_with("-stdlib=")
            || a.starts_with("-D")
            || a.starts_with("-U")
            || a.starts_with("--target=")
            || a.starts_with("-O")
            || a.starts_with("-m")
            || (a.starts_with("-f") && !is_incidental_f_flag(a));
        if relevant {
            out.push(a.to_string());
        }
    }
    out
}

fn is_incidental_f_flag(arg: &str) -> bool {
    arg.starts_with("-fmodule-file=")
        || arg.starts_with("-fmodule-output")
        || arg.starts_with("-fdiagnostics")
        || arg.starts_with("-fcolor-diagnostics")
        || arg.starts_with("-fno-color-diagnostics")
        || arg.starts_with("-fmessage-length")
}

/// Drop the source, the output and the action flags, keeping everything
/// that shapes how code is compiled.
fn strip_inputs(command: &[String]) -> Vec<String> {
    let source = source_index(command);
    let mut out = Vec::with_capacity(command.len());
    let mut i = 0;
    while i < command.len() {
        let arg = command[i].as_str();
        if Some(i) == source || matches!(arg, "-c" | "--precompile" | "-E" | "-S") {
            i += 1;
            continue;
        }
        if matches!(arg, "-o" | "-MF" | "-MT" | "-MQ" | "-x") {
            i += 2;
            continue;
        }
        if arg.starts_with("-fmodule-file=") || matches!(arg, "-MD" | "-MMD") {
            i += 1;
            continue;
        }
        out.push(command[i].clone());
        i += 1;
    }
    out
}

/// The command with its source replaced by `source`, compiled to nothing.
/// Used to scan a module interface with a translation unit's flags.
pub fn rewrite_source(command: &[String], source: &Path) -> Vec<String> {
    let mut out = strip_inputs(command);
    out.push("-x".to_string());
    out.push("c++-module".to_string());
    out.push("-c".to_string());
    out.push(source.to_string_lossy().into_owned());
    out
}

/// `-fmodule-file=NAME=PATH` flags for resolved module artifacts.
pub fn module_file_flags<'a>(artifacts: impl IntoIterator<Item = (&'a str, &'a Path)>) -> Vec<String> {
    artifacts
        .into_iter()
        .map(|(name, path)| format!("-fmodule-file={name}={}", path.display()))
        .collect()
}

/// Command that precompiles a module interface from a translation unit's
/// command template.
pub fn module_compile_command(
    template: &[String],
    source: &Path,
    dependencies: &[(String, std::path::PathBuf)],
    output: &Path,
) -> Vec<String> {
    let mut out = strip_inputs(template);
    out.extend(module_file_flags(
        dependencies.iter().map(|(n, p)| (n.as_str(), p.as_path())),
    ));
    out.push("-x".to_string());
    out.push("c++-module".to_string());
    out.push("--precompile".to_string());
    out.push(source.to_string_lossy().into_owned());
    out.push("-o".to_string());
    out.push(output.to_string_lossy().into_owned());
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn cmd(s: &str) -> Vec<String> {
        s.split_whitespace().map(str::to_string).collect()
    }

    #[test]
    fn finds_source_and_skips_output() {
        let c = cmd("clang++ -std=c++20 -c main.cpp -o main.o");
        assert_eq!(source_file(&c), Some("main.cpp"));
        let c = cmd("clang++ -o weird.cpp -c real.cc");
        assert_eq!(source_file(&c), Some("real.cc"));
        assert_eq!(source_file(&cmd("clang++ --version")), None);
    }

    #[test]
    fn context_keeps_relevant_flags() {
        let c = cmd("clang++ -std=c++20 -DNDEBUG -D FOO=1 -I include -O2 -fexceptions -fcolor-diagnostics -Wall -c a.cpp -o a.o");
        assert_eq!(
            context_flags(&c),
            vec!["-std=c++20", "-DNDEBUG", "-DFOO=1", "-O2", "-fexceptions"]
        );
    }

    #[test]
    fn include_paths_do_not_change_context() {
        let a = cmd("clang++ -std=c++20 -I a -c x.cpp");
        let b = cmd("clang++ -std=c++20 -I b -c y.cpp");
        assert_eq!(context_flags(&a), context_flags(&b));
    }

    #[test]
    fn compile_command_precompiles_module() {
        let template = cmd("clang++ -std=c++20 -fmodule-file=old=x.pcm -c main.cpp -o main.o");
        let deps = vec![("core".to_string(), PathBuf::from("/c/core.pcm"))];
        let out = module_compile_command(&template, Path::new("/s/app.cppm"), &deps, Path::new("/c/app.pcm"));
        assert_eq!(
            out,
            cmd("clang++ -std=c++20 -fmodule-file=core=/c/core.pcm -x c++-module --precompile /s/app.cppm -o /c/app.pcm")
        );
    }

    #[test]
    fn rewrite_swaps_source() {
        let c = cmd("clang++ -std=c++20 -c main.cpp -o main.o");
        assert_eq!(
            rewrite_source(&c, Path::new("m.cppm")),
            cmd("clang++ -std=c++20 -x c++-module -c m.cppm")
        );
    }
}
