use taskscope_macros::task_scoped;

// task contexts are thread-bound, async functions are rejected
#[task_scoped]
async fn handle(#[task_context] tenant: String) -> usize {
    tenant.len()
}

fn main() {}
