use stress_test::{stress_test_labeler, stress_test_scaling};

#[tokio::main]
async fn main() {
    let mut passed = true;

    println!("\n\n╔════════════════════════════════════════════════════════════╗");
    println!("║            ASYNC STRESS TESTS                               ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    // Test 1: small cluster, few workers
    let stats = stress_test_labeler(50, 500, 4).await;
    stats.print();
    passed &= stats.passed();

    // Test 2: medium cluster, more workers than cores
    let stats = stress_test_labeler(500, 5_000, 32).await;
    stats.print();
    passed &= stats.passed();

    // Test 3: scaling analysis
    passed &= stress_test_scaling(400, 100).await;

    if !passed {
        println!("\n✗ Invariant violations detected");
        std::process::exit(1);
    }
    println!("\n✓ All stress tests completed successfully!");
}
