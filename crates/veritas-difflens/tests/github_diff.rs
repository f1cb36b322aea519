use std::path::Path;

use veritas_core::{ChangeType, RefPair, ReviewConfig};
use veritas_difflens::filter::DiffFilter;
use veritas_difflens::parser::parse_unified_diff;
use veritas_difflens::Diff;

const PR_DIFF: &str = "\
diff --git a/app/verifier.py b/app/verifier.py
index 3b18e51..a9c4f2d 100644
--- a/app/verifier.py
+++ b/app/verifier.py
@@ -1,4 +1,5 @@
 import json
+import re
 from typing import List

 class Verifier:
@@ -40,2 +41,4 @@ class Verifier:
     def verify(self, claim):
-        return None
+        if not claim:
+            return None
+        return self._check(claim)
diff --git a/poetry.lock b/poetry.lock
index 1111111..2222222 100644
--- a/poetry.lock
+++ b/poetry.lock
@@ -1 +1 @@
-old = 1
+new = 2
diff --git a/static/logo.png b/static/logo.png
Binary files a/static/logo.png and b/static/logo.png differ
diff --git a/app/settings.json b/app/settings.json
new file mode 100644
--- /dev/null
+++ b/app/settings.json
@@ -0,0 +1,3 @@
+{
+  \"max_calls\": 10
+}
";

#[test]
fn parses_a_github_style_diff() {
    let files = parse_unified_diff(PR_DIFF).unwrap();
    let paths: Vec<_> = files.iter().map(|f| f.path().to_path_buf()).collect();
    assert_eq!(
        paths,
        vec![
            Path::new("app/verifier.py").to_path_buf(),
            Path::new("poetry.lock").to_path_buf(),
            Path::new("app/settings.json").to_path_buf(),
        ]
    );
    assert_eq!(files[0].hunks.len(), 2);
    assert_eq!(files[0].hunks[1].new_start, 41);
    assert_eq!(files[2].hunks[0].change_type, ChangeType::Add);
}

#[test]
fn patch_without_git_header() {
    let diff = "\
--- /dev/null
+++ b/demos/bad_code.rs
@@ -0,0 +1,3 @@
+fn main() {
+    println!(\"hello\");
+}
";
    let files = parse_unified_diff(diff).unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].new_path, Path::new("demos/bad_code.rs"));
    assert!(files[0].is_new_file);
}

#[test]
fn filtered_prompt_text_excludes_lock_files() {
    let refs = RefPair {
        base: "main".into(),
        head: "9f1c2e7".into(),
    };
    let diff = Diff::parse(PR_DIFF, refs).unwrap();
    let filtered = DiffFilter::from_config(&ReviewConfig::default()).apply(diff);

    assert_eq!(filtered.files().len(), 2);
    assert_eq!(filtered.refs().head, "9f1c2e7");
    let text = filtered.to_prompt_text(16_000);
    assert!(text.contains("+import re"));
    assert!(text.contains("+++ b/app/settings.json"));
    assert!(!text.contains("poetry.lock"));
}
